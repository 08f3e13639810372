//! Pooling and routing for the tether MCP client runtime.
//!
//! The [`SessionPool`] multiplexes request-scoped acquisitions over a bounded
//! fleet of long-lived sessions; the [`McpManager`] is the public surface
//! that routes tool and resource operations to pooled sessions.

mod manager;
mod pool;

pub use manager::McpManager;
pub use pool::SessionPool;
