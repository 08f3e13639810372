//! Transport layer for the tether MCP client runtime.
//!
//! Three wire substrates behind one contract: child-process stdio with
//! newline-delimited JSON, request/response HTTP with an optional server-sent
//! event channel, and full-duplex WebSocket with heartbeats and reconnection.
//! A transport never reaches back into the session; inbound frames and
//! failures flow through an event channel handed over at construction.

pub mod http;
mod sse;
pub mod stdio;
pub mod websocket;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_types::{ProtocolError, ServerConfig, TransportConfig, TransportError};
use tether_wire::Frame;

pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Connection state of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events a transport pushes to its session.
#[derive(Debug)]
pub enum TransportEvent {
    /// A well-formed inbound frame.
    Message(Frame),
    /// An inbound frame that failed envelope validation; dropped, never fatal.
    Malformed(ProtocolError),
    /// A transport failure; the session fails its pending requests on this.
    Error(TransportError),
    /// The connection state moved.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A WebSocket transport re-established itself after an unexpected close.
    Reconnected { attempts: u32 },
}

/// The uniform transport contract.
///
/// `send` accepts one frame; transports that support wire-level batching
/// override `send_batch`. Inbound traffic is never returned from `send` —
/// all frames arrive through the event channel, which is what lets the
/// correlator match responses by id rather than by arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Best-effort teardown; safe to call repeatedly.
    async fn disconnect(&self);

    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    async fn send_batch(&self, frames: &[Frame]) -> Result<(), TransportError> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState;
}

/// Construct the transport variant named by the config.
///
/// Dispatch happens here, at session construction, not per call.
pub fn build_transport(
    config: &ServerConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Arc<dyn Transport> {
    match &config.transport {
        TransportConfig::Stdio(stdio) => {
            Arc::new(StdioTransport::new(&config.id, stdio.clone(), events))
        }
        TransportConfig::Http(http) => {
            Arc::new(HttpTransport::new(&config.id, http.clone(), events))
        }
        TransportConfig::Websocket(ws) => Arc::new(WebSocketTransport::new(
            &config.id,
            ws.clone(),
            config.max_retries,
            config.retry_delay_ms,
            events,
        )),
    }
}

/// Shared state cell: current connection state plus the event channel.
///
/// Every state move emits a `StateChanged` event; emission failures (the
/// session is gone) are ignored.
pub(crate) struct StateCell {
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl StateCell {
    pub(crate) fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            events,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set(&self, to: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        drop(state);
        self.emit(TransportEvent::StateChanged { from, to });
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
