//! Integration tests for the HTTP transport.
//!
//! Uses a raw TCP test server speaking just enough HTTP/1.1 to exercise the
//! `/health` readiness probe and the `/rpc` request path.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tether_transport::{ConnectionState, HttpTransport, Transport, TransportEvent};
use tether_types::{HttpConfig, Readiness, TransportError};
use tether_wire::{Frame, Request};

fn response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

/// Read one full HTTP request (head plus content-length body).
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 8192];
    let mut data = Vec::new();
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        data.extend_from_slice(&buf[..n]);
        let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&data[..head_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(str::to_string))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= head_end + 4 + content_length {
            return Some(String::from_utf8_lossy(&data).to_string());
        }
    }
}

/// Serve connections forever: `/health` answers with `health_status`, `/rpc`
/// answers with `rpc_body` as JSON.
async fn spawn_server(health_status: &'static str, rpc_body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let reply = if request.starts_with("GET /health") {
                    response(health_status, "application/json", "{}")
                } else if request.starts_with("POST /rpc") {
                    response("200 OK", "application/json", rpc_body)
                } else {
                    response("404 Not Found", "text/plain", "not found")
                };
                let _ = socket.write_all(reply.as_bytes()).await;
            });
        }
    });
    url
}

fn config(url: String, readiness: Readiness) -> HttpConfig {
    HttpConfig {
        url,
        headers: Default::default(),
        auth: None,
        readiness,
        event_stream: false,
    }
}

#[tokio::test]
async fn lenient_probe_accepts_404() {
    let url = spawn_server("404 Not Found", "{}").await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::new("t", config(url, Readiness::Lenient), tx);
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn strict_probe_rejects_404() {
    let url = spawn_server("404 Not Found", "{}").await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::new("t", config(url, Readiness::Strict), tx);
    match transport.connect().await {
        Err(TransportError::ConnectFailed(detail)) => assert!(detail.contains("404")),
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert_eq!(transport.state(), ConnectionState::Error);
}

#[tokio::test]
async fn probe_rejects_server_error() {
    let url = spawn_server("500 Internal Server Error", "{}").await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::new("t", config(url, Readiness::Lenient), tx);
    assert!(matches!(
        transport.connect().await,
        Err(TransportError::ConnectFailed(_))
    ));
}

#[tokio::test]
async fn rpc_response_flows_through_events() {
    let url = spawn_server(
        "200 OK",
        r#"{"jsonrpc":"2.0","id":"t-1","result":{"ok":true}}"#,
    )
    .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::new("t", config(url, Readiness::Lenient), tx);
    transport.connect().await.unwrap();

    let req = Frame::Request(Request::new("t-1", "ping", None));
    transport.send(&req).await.unwrap();

    let frame = loop {
        match rx.recv().await.expect("event stream open") {
            TransportEvent::Message(frame) => break frame,
            _ => continue,
        }
    };
    assert_eq!(frame.id().unwrap().to_string(), "t-1");
    transport.disconnect().await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn batch_send_delivers_every_frame() {
    let url = spawn_server(
        "200 OK",
        r#"[{"jsonrpc":"2.0","id":"t-1","result":{}},{"jsonrpc":"2.0","id":"t-2","result":{}}]"#,
    )
    .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::new("t", config(url, Readiness::Lenient), tx);
    transport.connect().await.unwrap();

    let frames = vec![
        Frame::Request(Request::new("t-1", "ping", None)),
        Frame::Request(Request::new("t-2", "ping", None)),
    ];
    transport.send_batch(&frames).await.unwrap();

    let mut ids = Vec::new();
    while ids.len() < 2 {
        if let TransportEvent::Message(frame) = rx.recv().await.expect("event stream open") {
            ids.push(frame.id().unwrap().to_string());
        }
    }
    assert_eq!(ids, vec!["t-1", "t-2"]);
}

#[tokio::test]
async fn non_json_rpc_response_is_send_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let Some(request) = read_request(&mut socket).await else {
                continue;
            };
            let reply = if request.starts_with("GET /health") {
                response("200 OK", "application/json", "{}")
            } else {
                response("200 OK", "text/html", "<html>not json</html>")
            };
            let _ = socket.write_all(reply.as_bytes()).await;
        }
    });

    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::new("t", config(url, Readiness::Lenient), tx);
    transport.connect().await.unwrap();

    let req = Frame::Request(Request::new("t-1", "ping", None));
    match transport.send(&req).await {
        Err(TransportError::WriteFailed(detail)) => assert!(detail.contains("content-type")),
        other => panic!("expected WriteFailed, got {other:?}"),
    }
}
