//! Error hierarchy for the runtime.
//!
//! Grouped by concern: `TransportError` for wire substrate failures,
//! `ProtocolError` for frames and handshakes, and the top-level `McpError`
//! that callers of the session, pool, and manager see.

use serde_json::Value;
use thiserror::Error;

/// JSON-RPC standard error codes plus the MCP extension range.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
    pub const TRANSPORT_ERROR: i64 = -32001;
    pub const TIMEOUT: i64 = -32002;
    pub const AUTH_ERROR: i64 = -32003;
    pub const AUTHORIZATION_ERROR: i64 = -32004;
    pub const RESOURCE_NOT_FOUND: i64 = -32005;
    pub const RESOURCE_BUSY: i64 = -32006;
    pub const TOOL_EXECUTION_ERROR: i64 = -32007;
}

/// Failures of the wire substrate underneath a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("server process exited (code {code:?}, signal {signal:?})")]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("connection closed unexpectedly: {0}")]
    UnexpectedClose(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Violations of the JSON-RPC envelope or the MCP handshake.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server '{server}' does not advertise capability '{capability}'")]
    NotCapable { server: String, capability: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error type surfaced by sessions, the pool, and the manager.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An error object returned by the server for one of our requests.
    #[error("server error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("session '{server}' is not connected")]
    NotConnected { server: String },

    #[error("pool is disposed")]
    Disposed,

    #[error("connection cap reached and no session is evictable")]
    PoolCapExceeded,

    #[error("server '{server}' has no tool named '{name}'")]
    ToolNotFound { server: String, name: String },

    #[error("invalid arguments for tool '{tool}': {}", issues.join("; "))]
    ArgSchema { tool: String, issues: Vec<String> },

    /// The server ran the tool and reported `isError = true`.
    #[error("tool '{tool}' on '{server}' reported an execution error")]
    ToolExecution {
        server: String,
        tool: String,
        content: Value,
    },

    #[error("unknown server id '{0}'")]
    UnknownServer(String),
}

impl McpError {
    /// The wire error code this error maps to, for hosts that re-emit errors.
    pub fn code(&self) -> i64 {
        match self {
            McpError::Transport(_) => codes::TRANSPORT_ERROR,
            McpError::Protocol(ProtocolError::MalformedFrame(_)) => codes::PARSE_ERROR,
            McpError::Protocol(_) => codes::INVALID_REQUEST,
            McpError::Rpc { code, .. } => *code,
            McpError::Timeout { .. } => codes::TIMEOUT,
            McpError::ToolExecution { .. } => codes::TOOL_EXECUTION_ERROR,
            McpError::ToolNotFound { .. } => codes::METHOD_NOT_FOUND,
            McpError::ArgSchema { .. } => codes::INVALID_PARAMS,
            _ => codes::SERVER_ERROR,
        }
    }

    /// True for errors that indicate the session itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_) | McpError::NotConnected { .. } | McpError::Disposed
        )
    }

    /// Best-effort structural copy, for fanning one failure out to several
    /// waiters. Wrapped sources that cannot be cloned (I/O, JSON) are
    /// flattened to their message text.
    pub fn duplicate(&self) -> McpError {
        match self {
            McpError::Transport(t) => McpError::Transport(match t {
                TransportError::ProcessExited { code, signal } => TransportError::ProcessExited {
                    code: *code,
                    signal: *signal,
                },
                TransportError::ConnectFailed(d) => TransportError::ConnectFailed(d.clone()),
                TransportError::WriteFailed(d) => TransportError::WriteFailed(d.clone()),
                TransportError::UnexpectedClose(d) => TransportError::UnexpectedClose(d.clone()),
                TransportError::NotConnected => TransportError::NotConnected,
                other => TransportError::ConnectFailed(other.to_string()),
            }),
            McpError::Protocol(p) => McpError::Protocol(match p {
                ProtocolError::MalformedFrame(d) => ProtocolError::MalformedFrame(d.clone()),
                ProtocolError::Handshake(d) => ProtocolError::Handshake(d.clone()),
                ProtocolError::NotCapable { server, capability } => ProtocolError::NotCapable {
                    server: server.clone(),
                    capability: capability.clone(),
                },
                other => ProtocolError::Handshake(other.to_string()),
            }),
            McpError::Rpc {
                code,
                message,
                data,
            } => McpError::Rpc {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            McpError::Timeout { method, timeout_ms } => McpError::Timeout {
                method: method.clone(),
                timeout_ms: *timeout_ms,
            },
            McpError::NotConnected { server } => McpError::NotConnected {
                server: server.clone(),
            },
            McpError::Disposed => McpError::Disposed,
            McpError::PoolCapExceeded => McpError::PoolCapExceeded,
            McpError::ToolNotFound { server, name } => McpError::ToolNotFound {
                server: server.clone(),
                name: name.clone(),
            },
            McpError::ArgSchema { tool, issues } => McpError::ArgSchema {
                tool: tool.clone(),
                issues: issues.clone(),
            },
            McpError::ToolExecution {
                server,
                tool,
                content,
            } => McpError::ToolExecution {
                server: server.clone(),
                tool: tool.clone(),
                content: content.clone(),
            },
            McpError::UnknownServer(id) => McpError::UnknownServer(id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_schema_error_joins_issues() {
        let err = McpError::ArgSchema {
            tool: "echo".into(),
            issues: vec!["missing required field 'text'".into(), "bad type".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("echo"));
        assert!(msg.contains("missing required field 'text'; bad type"));
    }

    #[test]
    fn rpc_error_keeps_server_code() {
        let err = McpError::Rpc {
            code: codes::RESOURCE_BUSY,
            message: "locked".into(),
            data: None,
        };
        assert_eq!(err.code(), -32006);
    }

    #[test]
    fn timeout_maps_to_extension_code() {
        let err = McpError::Timeout {
            method: "tools/execute".into(),
            timeout_ms: 200,
        };
        assert_eq!(err.code(), codes::TIMEOUT);
        assert!(err.to_string().contains("200ms"));
    }

    #[test]
    fn transport_errors_are_fatal() {
        let err = McpError::Transport(TransportError::NotConnected);
        assert!(err.is_fatal());
        let err = McpError::ToolNotFound {
            server: "a".into(),
            name: "b".into(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn duplicate_preserves_variant_and_detail() {
        let err = McpError::Timeout {
            method: "tools/execute".into(),
            timeout_ms: 200,
        };
        match err.duplicate() {
            McpError::Timeout { method, timeout_ms } => {
                assert_eq!(method, "tools/execute");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }

        let err = McpError::Transport(TransportError::SpawnFailed {
            command: "npx".into(),
            source: std::io::Error::other("boom"),
        });
        match err.duplicate() {
            McpError::Transport(TransportError::ConnectFailed(detail)) => {
                assert!(detail.contains("npx"));
            }
            other => panic!("expected flattened transport error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_maps_to_parse_error() {
        let err = McpError::Protocol(ProtocolError::MalformedFrame("no jsonrpc".into()));
        assert_eq!(err.code(), codes::PARSE_ERROR);
    }
}
