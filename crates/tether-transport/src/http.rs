//! Request/response HTTP transport.
//!
//! `connect` probes `<base>/health`; every `send` POSTs one frame (or a
//! batch) to `<base>/rpc` and feeds the JSON response body back through the
//! codec. Servers that push notifications expose `<base>/events` as an SSE
//! stream, consumed by a background task when enabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tether_types::{HttpConfig, Readiness, TransportError};
use tether_wire::{codec, Frame};

use crate::sse::SseParser;
use crate::{ConnectionState, StateCell, Transport, TransportEvent};

/// HTTP transport: stateless on the wire, stateful in the probe result.
pub struct HttpTransport {
    server_id: String,
    config: HttpConfig,
    base: String,
    client: reqwest::Client,
    state: Arc<StateCell>,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(
        server_id: &str,
        config: HttpConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let base = config.url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            } else {
                tracing::warn!(server_id, header = %name, "skipping invalid header");
            }
        }
        if let Some(auth) = &config.auth {
            let (name, value) = auth.header();
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            server_id: server_id.to_string(),
            config,
            base,
            client,
            state: Arc::new(StateCell::new(events)),
            events_task: Mutex::new(None),
        }
    }

    /// Deliver a response body's frames onto the event channel.
    fn dispatch_body(&self, body: &str) -> Result<(), TransportError> {
        if body.trim().is_empty() {
            return Ok(());
        }
        let frames = codec::decode_body(body)
            .map_err(|e| TransportError::WriteFailed(format!("unparseable response body: {e}")))?;
        for frame in frames {
            match frame {
                Ok(frame) => self.state.emit(TransportEvent::Message(frame)),
                Err(e) => {
                    tracing::warn!(server_id = %self.server_id, error = %e, "dropping malformed frame in response body");
                    self.state.emit(TransportEvent::Malformed(e));
                }
            }
        }
        Ok(())
    }

    async fn post_rpc(&self, body: String) -> Result<(), TransportError> {
        if self.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let response = self
            .client
            .post(format!("{}/rpc", self.base))
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::WriteFailed(format!(
                "rpc endpoint returned {status}"
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("application/json") {
            return Err(TransportError::WriteFailed(format!(
                "rpc endpoint returned content-type '{content_type}', expected application/json"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.dispatch_body(&body)
    }

    /// Background consumer of the optional `<base>/events` push channel.
    fn spawn_event_stream(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = format!("{}/events", self.base);
        let state = Arc::clone(&self.state);
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let response = match client
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
            {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    tracing::debug!(server_id = %server_id, status = %r.status(), "event stream unavailable");
                    return;
                }
                Err(e) => {
                    tracing::debug!(server_id = %server_id, error = %e, "event stream unavailable");
                    return;
                }
            };

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!(server_id = %server_id, error = %e, "event stream ended");
                        return;
                    }
                };
                for record in parser.feed(&String::from_utf8_lossy(&chunk)) {
                    match codec::decode(&record.data) {
                        Ok(frame) => state.emit(TransportEvent::Message(frame)),
                        Err(e) => {
                            tracing::warn!(server_id = %server_id, error = %e, "dropping malformed pushed frame");
                            state.emit(TransportEvent::Malformed(e));
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.state.get() == ConnectionState::Connected {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);

        let response = self
            .client
            .get(format!("{}/health", self.base))
            .send()
            .await
            .map_err(|e| {
                self.state.set(ConnectionState::Error);
                TransportError::ConnectFailed(e.to_string())
            })?;

        let status = response.status();
        let reachable = status.is_success()
            || (self.config.readiness == Readiness::Lenient && status.as_u16() == 404);
        if !reachable {
            self.state.set(ConnectionState::Error);
            return Err(TransportError::ConnectFailed(format!(
                "health probe returned {status}"
            )));
        }

        if self.config.event_stream {
            let mut task = self.events_task.lock().await;
            if task.is_none() {
                *task = Some(self.spawn_event_stream());
            }
        }

        self.state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.events_task.lock().await.take() {
            task.abort();
        }
        self.state.set(ConnectionState::Disconnected);
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let body = codec::encode(frame).map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.post_rpc(body).await
    }

    async fn send_batch(&self, frames: &[Frame]) -> Result<(), TransportError> {
        let body =
            codec::encode_batch(frames).map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.post_rpc(body).await
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}
