//! Shared types for the tether MCP client runtime.
//!
//! Home of the configuration records that parameterize sessions and the pool,
//! the error hierarchy used across every crate, and the lifecycle event enum
//! emitted to host subscribers.

pub mod config;
pub mod error;
pub mod event;

pub use config::{
    AuthConfig, HttpConfig, McpConfig, PoolConfig, Readiness, ServerConfig, StdioConfig,
    TransportConfig, WebsocketConfig,
};
pub use error::{codes, McpError, ProtocolError, TransportError};
pub use event::McpEvent;
