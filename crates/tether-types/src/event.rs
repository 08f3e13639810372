//! Lifecycle events emitted by the runtime.
//!
//! One typed stream replaces per-component ad-hoc listeners: the pool and the
//! sessions publish onto a single broadcast channel and consumers filter by
//! variant or by server id.

use serde_json::Value;

/// A lifecycle event, always tagged with the server it concerns.
#[derive(Debug, Clone)]
pub enum McpEvent {
    /// A new session entered the pool.
    ConnectionCreated { server_id: String },
    /// Handshake and discovery completed; carries what the server reported.
    ConnectionInitialized {
        server_id: String,
        server_name: String,
        server_version: String,
        protocol_version: String,
    },
    /// The transport dropped out from under a connected session.
    ConnectionLost { server_id: String, detail: String },
    /// The session failed with a transport or protocol error.
    ConnectionError { server_id: String, detail: String },
    /// A session was disconnected deliberately (eviction, idle sweep, shutdown).
    ConnectionClosed { server_id: String },
    /// A use-budget renewal swapped in a fresh session.
    ConnectionRenewed { server_id: String },
    /// A renewal attempt failed; the old session stays in place.
    RenewalFailed { server_id: String, detail: String },
    /// Disconnect during cleanup reported an error that was otherwise ignored.
    CleanupError { server_id: String, detail: String },
    /// A WebSocket session re-established itself after an unexpected close.
    Reconnected { server_id: String, attempts: u32 },
    /// Progress notification forwarded from a running tool.
    ToolProgress { server_id: String, detail: Value },
}

impl McpEvent {
    /// The server this event concerns.
    pub fn server_id(&self) -> &str {
        match self {
            McpEvent::ConnectionCreated { server_id }
            | McpEvent::ConnectionInitialized { server_id, .. }
            | McpEvent::ConnectionLost { server_id, .. }
            | McpEvent::ConnectionError { server_id, .. }
            | McpEvent::ConnectionClosed { server_id }
            | McpEvent::ConnectionRenewed { server_id }
            | McpEvent::RenewalFailed { server_id, .. }
            | McpEvent::CleanupError { server_id, .. }
            | McpEvent::Reconnected { server_id, .. }
            | McpEvent::ToolProgress { server_id, .. } => server_id,
        }
    }
}
