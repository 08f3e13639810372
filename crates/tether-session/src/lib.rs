//! Per-server MCP client session for the tether runtime.
//!
//! A session owns exactly one transport and drives the protocol state
//! machine for one server: handshake, capability-gated discovery, and
//! steady-state serving. Request/response correlation lives in [`rpc`];
//! pre-flight argument validation in [`schema`].

pub mod protocol;
pub mod rpc;
pub mod schema;
mod session;

pub use protocol::{
    InitializeResult, PromptInfo, ResourceInfo, ServerCapabilities, ServerInfo, ToolExecuteResult,
    ToolInfo,
};
pub use rpc::RpcClient;
pub use session::McpSession;
