//! JSON-RPC request/response correlation.
//!
//! One correlator per session. Outbound requests get ids of the form
//! `<server-id>-<counter>`, park a waiter in the pending map, and resolve
//! when a matching response arrives — matched purely by id, never by
//! arrival order. Notifications fan out to method-keyed subscribers, with
//! unmatched ones draining to a fallback channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use tether_transport::Transport;
use tether_types::McpError;
use tether_wire::{Frame, Notification, Request, RequestId, Response};

type Waiter = oneshot::Sender<Result<Response, McpError>>;
type PendingMap = Arc<Mutex<HashMap<RequestId, Waiter>>>;

/// Removes the pending entry when the waiter goes away without an answer —
/// timeout and caller cancellation both land here.
struct PendingGuard {
    pending: PendingMap,
    id: RequestId,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&self.id);
        }
    }
}

/// The correlator: assigns ids, parks callers, dispatches inbound frames.
pub struct RpcClient {
    server_id: String,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    next_id: AtomicU64,
    pending: PendingMap,
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Notification>>>,
    fallback: mpsc::UnboundedSender<Notification>,
}

impl RpcClient {
    pub fn new(
        server_id: &str,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
        fallback: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            transport,
            request_timeout,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    /// Globally unique within the session: `<server-id>-<monotonic counter>`.
    fn next_request_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::String(format!("{}-{}", self.server_id, n))
    }

    /// Send a request and wait for its response or the per-request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id.clone(), tx);
        }
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
            armed: true,
        };

        let frame = Frame::Request(Request::new(id, method, params));
        tracing::debug!(server_id = %self.server_id, method, "sending request");
        self.transport.send(&frame).await.map_err(McpError::from)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                let response = outcome?;
                response.into_result().map_err(|e| McpError::Rpc {
                    code: e.code,
                    message: e.message,
                    data: e.data,
                })
            }
            Ok(Err(_)) => {
                // Waiter dropped without a verdict; the session tore down.
                guard.disarm();
                Err(McpError::NotConnected {
                    server: self.server_id.clone(),
                })
            }
            Err(_) => {
                // Guard removes the pending entry; a late response is dropped.
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification; nothing is awaited beyond the write.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let frame = Frame::Notification(Notification::new(method, params));
        tracing::debug!(server_id = %self.server_id, method, "sending notification");
        self.transport.send(&frame).await.map_err(McpError::from)
    }

    /// Subscribe to server-initiated notifications for one method.
    pub fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.insert(method.to_string(), tx);
        rx
    }

    /// Route one inbound frame.
    pub fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                let waiter = {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.remove(&response.id)
                };
                match waiter {
                    Some(tx) => {
                        // A cancelled caller may already be gone; that is fine.
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        tracing::warn!(
                            server_id = %self.server_id,
                            id = %response.id,
                            "dropping response with no pending request"
                        );
                    }
                }
            }
            Frame::Notification(notification) => {
                let delivered = {
                    let subscribers =
                        self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
                    match subscribers.get(&notification.method) {
                        Some(tx) => tx.send(notification.clone()).is_ok(),
                        None => false,
                    }
                };
                if !delivered {
                    let _ = self.fallback.send(notification);
                }
            }
            Frame::Request(request) => {
                // Server-initiated requests are not part of this client's
                // contract; drop them loudly enough to diagnose.
                tracing::warn!(
                    server_id = %self.server_id,
                    method = %request.method,
                    "ignoring server-initiated request"
                );
            }
        }
    }

    /// Fail every parked waiter; used on disconnect and transport error.
    pub fn fail_all(&self, mut make_error: impl FnMut() -> McpError) {
        let drained: Vec<Waiter> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tether_transport::{ConnectionState, TransportEvent};
    use tether_types::TransportError;

    /// Transport stub that records sent frames and never answers.
    struct SilentTransport {
        sent: Mutex<Vec<Frame>>,
    }

    impl SilentTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|f| f.method().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    fn rpc(transport: Arc<SilentTransport>, timeout_ms: u64) -> (Arc<RpcClient>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(RpcClient::new(
                "srv",
                transport,
                Duration::from_millis(timeout_ms),
                tx,
            )),
            rx,
        )
    }

    #[tokio::test]
    async fn response_resolves_waiter() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 1000);

        let requester = Arc::clone(&client);
        let call = tokio::spawn(async move {
            requester
                .request("tools/list", None)
                .await
        });

        // Wait for the request frame to be sent, then answer it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count(), 1);
        client.dispatch(Frame::Response(Response::ok(
            "srv-1",
            serde_json::json!({"tools": []}),
        )));

        let value = call.await.unwrap().unwrap();
        assert!(value.get("tools").is_some());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_match_by_id() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 1000);

        let first = {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.request("a", None).await })
        };
        let second = {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.request("b", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count(), 2);

        // Answer in reverse order of transmission; each reply carries its
        // request's method so the callers can be told apart.
        let sent: Vec<(String, RequestId)> = transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| (f.method().unwrap().to_string(), f.id().unwrap().clone()))
            .collect();
        for (method, id) in sent.iter().rev() {
            client.dispatch(Frame::Response(Response::ok(
                id.clone(),
                serde_json::json!(method),
            )));
        }

        assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), serde_json::json!("b"));
    }

    #[tokio::test]
    async fn timeout_cleans_pending_and_drops_late_response() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 50);

        let started = std::time::Instant::now();
        let err = client.request("slow", None).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(client.pending_count(), 0);

        // A response arriving after the timeout is dropped without panicking.
        client.dispatch(Frame::Response(Response::ok("srv-1", Value::Null)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_removes_pending_entry() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 10_000);

        let requester = Arc::clone(&client);
        let call = tokio::spawn(async move { requester.request("x", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_maps_to_rpc_error() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 1000);

        let requester = Arc::clone(&client);
        let call = tokio::spawn(async move { requester.request("x", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.dispatch(Frame::Response(Response::err(
            "srv-1",
            tether_wire::ErrorObject {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            },
        )));

        match call.await.unwrap() {
            Err(McpError::Rpc { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_all_resolves_every_waiter() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 10_000);

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let c = Arc::clone(&client);
                tokio::spawn(async move { c.request("x", None).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count(), 3);

        client.fail_all(|| McpError::NotConnected {
            server: "srv".into(),
        });

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(McpError::NotConnected { .. })
            ));
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn notifications_route_to_subscriber_or_fallback() {
        let transport = SilentTransport::new();
        let (client, mut fallback_rx) = rpc(Arc::clone(&transport), 1000);
        let mut log_rx = client.subscribe("notifications/log");

        client.dispatch(Frame::Notification(Notification::new(
            "notifications/log",
            Some(serde_json::json!({"message": "hi"})),
        )));
        client.dispatch(Frame::Notification(Notification::new(
            "notifications/unknown",
            None,
        )));

        let logged = log_rx.recv().await.unwrap();
        assert_eq!(logged.method, "notifications/log");
        let fell_back = fallback_rx.recv().await.unwrap();
        assert_eq!(fell_back.method, "notifications/unknown");
    }

    #[tokio::test]
    async fn request_ids_are_sequential_and_prefixed() {
        let transport = SilentTransport::new();
        let (client, _rx) = rpc(Arc::clone(&transport), 10);

        let _ = client.request("a", None).await;
        let _ = client.request("b", None).await;

        let sent = transport.sent.lock().unwrap();
        let ids: Vec<String> = sent
            .iter()
            .filter_map(|f| f.id().map(|id| id.to_string()))
            .collect();
        assert_eq!(ids, vec!["srv-1", "srv-2"]);
        drop(sent);
        assert_eq!(transport.sent_methods(), vec!["a", "b"]);
    }
}
