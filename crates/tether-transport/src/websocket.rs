//! Full-duplex WebSocket transport.
//!
//! One text frame per JSON-RPC frame; binary frames are not used. Liveness
//! uses control ping/pong on a fixed cycle, independent of the `ping` RPC
//! method. An unexpected close while connected triggers reconnection with
//! exponential backoff; a graceful disconnect closes with code 1000 and
//! waits for the peer's close frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tether_types::{TransportError, WebsocketConfig};
use tether_wire::{codec, Frame};

use crate::{ConnectionState, StateCell, Transport, TransportEvent};

const WRITE_QUEUE: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum WsCommand {
    Frame(String),
    Ping(Vec<u8>),
    Close,
}

struct WsIo {
    write_tx: mpsc::Sender<WsCommand>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    keeper: JoinHandle<()>,
}

struct WsShared {
    server_id: String,
    config: WebsocketConfig,
    max_retries: u32,
    retry_delay_ms: u64,
    state: StateCell,
    closing: AtomicBool,
    last_pong: StdMutex<Instant>,
    io: Mutex<Option<WsIo>>,
}

/// WebSocket transport handle; all live state is shared with its tasks.
pub struct WebSocketTransport {
    shared: Arc<WsShared>,
}

impl WebSocketTransport {
    pub fn new(
        server_id: &str,
        config: WebsocketConfig,
        max_retries: u32,
        retry_delay_ms: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(WsShared {
                server_id: server_id.to_string(),
                config,
                max_retries,
                retry_delay_ms,
                state: StateCell::new(events),
                closing: AtomicBool::new(false),
                last_pong: StdMutex::new(Instant::now()),
                io: Mutex::new(None),
            }),
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Ok(mut io) = self.shared.io.try_lock() {
            if let Some(io) = io.take() {
                io.reader.abort();
                io.writer.abort();
                io.keeper.abort();
            }
        }
    }
}

impl WsShared {
    fn touch_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn pong_since(&self, when: Instant) -> bool {
        *self.last_pong.lock().unwrap_or_else(|e| e.into_inner()) >= when
    }

    /// Open the socket with handshake headers and auth applied.
    async fn open_socket(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                request.headers_mut().insert(name, value);
            } else {
                tracing::warn!(server_id = %self.server_id, header = %name, "skipping invalid handshake header");
            }
        }
        if let Some(auth) = &self.config.auth {
            let (name, value) = auth.header();
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                request.headers_mut().insert(name, value);
            }
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Ok(stream)
    }
}

/// Wire a fresh socket into writer, reader, and heartbeat tasks.
///
/// The writer task is the only owner of the sink, so user frames and pings
/// can never interleave at the frame level.
async fn spawn_io(shared: &Arc<WsShared>, stream: WsStream) {
    let (mut sink, mut source) = stream.split();
    let (write_tx, mut write_rx) = mpsc::channel::<WsCommand>(WRITE_QUEUE);

    let writer_shared = Arc::clone(shared);
    let writer = tokio::spawn(async move {
        while let Some(command) = write_rx.recv().await {
            let (message, stop_after) = match command {
                WsCommand::Frame(text) => (Message::Text(text.into()), false),
                WsCommand::Ping(payload) => (Message::Ping(payload.into()), false),
                WsCommand::Close => (
                    Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })),
                    true,
                ),
            };
            if let Err(e) = sink.send(message).await {
                writer_shared.state.emit(TransportEvent::Error(
                    TransportError::WriteFailed(e.to_string()),
                ));
                break;
            }
            if stop_after {
                break;
            }
        }
    });

    let reader_shared = Arc::clone(shared);
    let reader = tokio::spawn(async move {
        let reason = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                    Ok(frame) => reader_shared.state.emit(TransportEvent::Message(frame)),
                    Err(e) => {
                        tracing::warn!(
                            server_id = %reader_shared.server_id,
                            error = %e,
                            "dropping malformed websocket frame"
                        );
                        reader_shared.state.emit(TransportEvent::Malformed(e));
                    }
                },
                Some(Ok(Message::Pong(_))) => reader_shared.touch_pong(),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => format!("closed with code {}", u16::from(f.code)),
                        None => "closed without a close frame".into(),
                    };
                }
                Some(Ok(_)) => {} // binary and inbound ping are not part of the protocol
                Some(Err(e)) => break format!("read error: {e}"),
                None => break "stream ended".into(),
            }
        };
        if reader_shared.closing.load(Ordering::SeqCst) {
            return;
        }
        tokio::spawn(reconnect(Arc::clone(&reader_shared), reason));
    });

    let keeper_shared = Arc::clone(shared);
    let keeper_tx = write_tx.clone();
    let keeper = tokio::spawn(async move {
        let interval = Duration::from_millis(keeper_shared.config.ping_interval_ms);
        let pong_timeout = Duration::from_millis(keeper_shared.config.pong_timeout_ms);
        loop {
            tokio::time::sleep(interval).await;
            if keeper_shared.closing.load(Ordering::SeqCst) {
                return;
            }
            let sent_at = Instant::now();
            if keeper_tx.send(WsCommand::Ping(b"hb".to_vec())).await.is_err() {
                return;
            }
            tokio::time::sleep(pong_timeout).await;
            if keeper_shared.closing.load(Ordering::SeqCst) {
                return;
            }
            if !keeper_shared.pong_since(sent_at) {
                tracing::warn!(
                    server_id = %keeper_shared.server_id,
                    timeout_ms = keeper_shared.config.pong_timeout_ms,
                    "no pong within timeout, terminating socket"
                );
                tokio::spawn(reconnect(
                    Arc::clone(&keeper_shared),
                    "heartbeat pong not received".into(),
                ));
                return;
            }
        }
    });

    *shared.io.lock().await = Some(WsIo {
        write_tx,
        reader,
        writer,
        keeper,
    });
}

/// Tear down the current socket and try to re-establish it with exponential
/// backoff (`retry_delay * 2^(n-1)` for 1-based attempt `n`).
///
/// Returns a boxed, explicitly `Send` future: `reconnect` and `spawn_io` are
/// mutually recursive through `tokio::spawn`, and the compiler cannot prove
/// `Send` for that cycle via the opaque `async fn` return type alone.
fn reconnect(
    shared: Arc<WsShared>,
    reason: String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(reconnect_inner(shared, reason))
}

async fn reconnect_inner(shared: Arc<WsShared>, reason: String) {
    if let Some(io) = shared.io.lock().await.take() {
        io.reader.abort();
        io.writer.abort();
        io.keeper.abort();
    }
    if shared.closing.load(Ordering::SeqCst) {
        return;
    }

    shared.state.emit(TransportEvent::Error(
        TransportError::UnexpectedClose(reason.clone()),
    ));
    shared.state.set(ConnectionState::Reconnecting);
    tracing::warn!(server_id = %shared.server_id, %reason, "websocket closed unexpectedly, reconnecting");

    let mut last_error = String::new();
    for attempt in 1..=shared.max_retries {
        let delay = shared
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt - 1));
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }
        match shared.open_socket().await {
            Ok(stream) => {
                shared.touch_pong();
                spawn_io(&shared, stream).await;
                shared.state.set(ConnectionState::Connected);
                shared.state.emit(TransportEvent::Reconnected { attempts: attempt });
                tracing::info!(server_id = %shared.server_id, attempt, "websocket reconnected");
                return;
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    server_id = %shared.server_id,
                    attempt,
                    max = shared.max_retries,
                    error = %last_error,
                    "reconnect attempt failed"
                );
            }
        }
    }

    shared.state.set(ConnectionState::Error);
    shared.state.emit(TransportEvent::Error(
        TransportError::UnexpectedClose(format!(
            "reconnect failed after {} attempts: {last_error}",
            shared.max_retries
        )),
    ));
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.io.lock().await.is_some() {
            return Ok(());
        }
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.state.set(ConnectionState::Connecting);

        let stream = self.shared.open_socket().await.inspect_err(|_| {
            self.shared.state.set(ConnectionState::Error);
        })?;
        self.shared.touch_pong();
        spawn_io(&self.shared, stream).await;
        self.shared.state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let Some(mut io) = self.shared.io.lock().await.take() else {
            self.shared.state.set(ConnectionState::Disconnected);
            return;
        };

        // Normal closure, then give the peer a window to answer.
        let _ = io.write_tx.send(WsCommand::Close).await;
        if tokio::time::timeout(Duration::from_secs(5), &mut io.reader)
            .await
            .is_err()
        {
            tracing::debug!(server_id = %self.shared.server_id, "peer did not answer close frame");
            io.reader.abort();
        }
        io.writer.abort();
        io.keeper.abort();
        self.shared.state.set(ConnectionState::Disconnected);
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let write_tx = {
            let io = self.shared.io.lock().await;
            match io.as_ref() {
                Some(io) if self.shared.state.get() == ConnectionState::Connected => {
                    io.write_tx.clone()
                }
                _ => return Err(TransportError::NotConnected),
            }
        };
        let text = codec::encode(frame).map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        write_tx
            .send(WsCommand::Frame(text))
            .await
            .map_err(|_| TransportError::WriteFailed("writer task has stopped".into()))
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }
}
