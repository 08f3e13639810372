//! End-to-end session tests over the stdio transport.
//!
//! The mock MCP server is a bash one-liner speaking newline-delimited
//! JSON-RPC on stdout. When the `CAPTURE` env var is set it appends every
//! inbound line to that file, which is how the tests assert on the exact
//! frame sequence the session produced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::broadcast;

use tether_session::McpSession;
use tether_types::{McpError, McpEvent, ServerConfig, StdioConfig, TransportConfig, TransportError};

const INIT_REPLY: &str = r#"printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"1.0","serverInfo":{"name":"x","version":"1"},"capabilities":{"tools":{"list":true,"execute":true}}}}\n' "$id""#;

const TOOLS_REPLY: &str = r#"printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"echo","description":"","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$id""#;

const RESOURCES_FAIL_REPLY: &str = r#"printf '{"jsonrpc":"2.0","id":"%s","error":{"code":-32601,"message":"Method not found"}}\n' "$id""#;

const ECHO_REPLY: &str = r#"printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"hi"}],"isError":false}}\n' "$id""#;

/// Build the mock server script with a pluggable `tools/execute` behavior.
fn mock_script(init: &str, execute_behavior: &str) -> String {
    format!(
        r#"while IFS= read -r line; do
  if [ -n "$CAPTURE" ]; then printf '%s\n' "$line" >> "$CAPTURE"; fi
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*) {init} ;;
    *'"method":"tools/list"'*) {TOOLS_REPLY} ;;
    *'"method":"resources/list"'*) {RESOURCES_FAIL_REPLY} ;;
    *'"method":"tools/execute"'*) {execute_behavior} ;;
    *'"method":"ping"'*) printf '{{"jsonrpc":"2.0","id":"%s","result":{{}}}}\n' "$id" ;;
    *) ;;
  esac
done"#
    )
}

fn config(id: &str, script: &str, env: HashMap<String, String>) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        name: None,
        transport: TransportConfig::Stdio(StdioConfig {
            command: "bash".into(),
            args: vec!["-c".into(), script.to_string()],
            env,
            ready_delay_ms: 50,
            grace_shutdown_ms: 1000,
        }),
        connect_timeout_ms: None,
        request_timeout_ms: None,
        max_retries: 5,
        retry_delay_ms: 1000,
        keep_alive: true,
    }
}

fn capture_env(path: &std::path::Path) -> HashMap<String, String> {
    HashMap::from([("CAPTURE".to_string(), path.display().to_string())])
}

/// Methods seen by the mock server, in arrival order.
fn captured_methods(path: &std::path::Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|v| v["method"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn s1_stdio_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("frames.jsonl");
    let script = mock_script(INIT_REPLY, ECHO_REPLY);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("s1", &script, capture_env(&capture)),
        Duration::from_secs(5),
        events,
    );

    session.connect().await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.server_info().unwrap().name, "x");
    assert!(session.capabilities().can_execute_tools());

    let content = session
        .execute_tool("echo", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(content, json!([{"type": "text", "text": "hi"}]));

    session.disconnect().await;
    assert!(!session.is_connected());

    let methods = captured_methods(&capture);
    assert_eq!(methods[0], "initialize");
    assert_eq!(methods[1], "notifications/initialized");
    // Discovery runs in parallel; both lists must appear before the call.
    assert!(methods[2..4].contains(&"tools/list".to_string()));
    assert!(methods[2..4].contains(&"resources/list".to_string()));
    assert_eq!(methods.last().map(String::as_str), Some("tools/execute"));
}

#[tokio::test]
async fn s2_argument_validation_rejects_before_sending() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("frames.jsonl");
    let script = mock_script(INIT_REPLY, ECHO_REPLY);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("s2", &script, capture_env(&capture)),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();

    match session.execute_tool("echo", json!({})).await {
        Err(McpError::ArgSchema { tool, issues }) => {
            assert_eq!(tool, "echo");
            assert!(issues.iter().any(|i| i.contains("'text'")));
        }
        other => panic!("expected ArgSchema, got {other:?}"),
    }

    // Unknown names never round-trip either.
    assert!(matches!(
        session.execute_tool("bogus", json!({})).await,
        Err(McpError::ToolNotFound { .. })
    ));

    session.disconnect().await;
    assert!(!captured_methods(&capture).contains(&"tools/execute".to_string()));
}

#[tokio::test]
async fn s3_timeout_leaves_session_ready() {
    let script = mock_script(INIT_REPLY, ":"); // never answers tools/execute
    let (events, _) = broadcast::channel(64);
    let mut cfg = config("s3", &script, HashMap::new());
    cfg.request_timeout_ms = Some(200);
    let session = McpSession::new(&cfg, Duration::from_millis(200), events);
    session.connect().await.unwrap();

    let started = Instant::now();
    let err = session
        .execute_tool("echo", json!({"text": "hi"}))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    match err {
        McpError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 200),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1000), "elapsed {elapsed:?}");

    // The session stays Ready: cached listing and liveness still work.
    assert!(session.is_connected());
    assert_eq!(session.pending_requests(), 0);
    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "echo");
    assert!(session.ping().await);

    session.disconnect().await;
}

#[tokio::test]
async fn s4_process_exit_fails_pending_call() {
    let script = mock_script(INIT_REPLY, "exit 1");
    let (events, mut events_rx) = broadcast::channel(64);
    let session = McpSession::new(
        &config("s4", &script, HashMap::new()),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();

    let err = session
        .execute_tool("echo", json!({"text": "hi"}))
        .await
        .unwrap_err();
    match err {
        McpError::Transport(TransportError::ProcessExited { code, .. }) => {
            assert_eq!(code, Some(1));
        }
        other => panic!("expected ProcessExited, got {other:?}"),
    }
    assert!(!session.is_connected());
    assert_eq!(session.pending_requests(), 0);

    // The teardown shows up on the lifecycle stream.
    let lost = loop {
        match events_rx.recv().await.unwrap() {
            McpEvent::ConnectionLost { server_id, .. } => break server_id,
            _ => continue,
        }
    };
    assert_eq!(lost, "s4");
}

#[tokio::test]
async fn capability_gating_blocks_ungated_operations() {
    // Advertises tools.list but not tools.execute, and no resources at all.
    let init = r#"printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"1.0","serverInfo":{"name":"x","version":"1"},"capabilities":{"tools":{"list":true}}}}\n' "$id""#;
    let script = mock_script(init, ECHO_REPLY);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("caps", &script, HashMap::new()),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();

    assert!(matches!(
        session.execute_tool("echo", json!({"text": "hi"})).await,
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        session.list_resources().await,
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        session.get_resource("file:///x").await,
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        session.watch_resource("file:///x").await,
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        session.list_prompts().await,
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        session.get_prompt("summarize", None).await,
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        session.set_log_level("debug").await,
        Err(McpError::Protocol(_))
    ));
    // Gated ops failed, but the session itself is healthy.
    assert!(session.is_connected());
    session.disconnect().await;
}

#[tokio::test]
async fn repeated_list_tools_uses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("frames.jsonl");
    let script = mock_script(INIT_REPLY, ECHO_REPLY);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("cache", &script, capture_env(&capture)),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();

    let first = session.list_tools().await.unwrap();
    let second = session.list_tools().await.unwrap();
    assert_eq!(first.len(), second.len());
    session.disconnect().await;

    // One tools/list on the wire: discovery populated the cache and both
    // calls served from it.
    let count = captured_methods(&capture)
        .iter()
        .filter(|m| *m == "tools/list")
        .count();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn refresh_refetches_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("frames.jsonl");
    let script = mock_script(INIT_REPLY, ECHO_REPLY);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("refresh", &script, capture_env(&capture)),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();
    session.refresh().await.unwrap();
    session.disconnect().await;

    let count = captured_methods(&capture)
        .iter()
        .filter(|m| *m == "tools/list")
        .count();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn progress_notifications_reach_the_event_stream() {
    // tools/execute first pushes a progress notification, then the result.
    let execute = r#"printf '{"jsonrpc":"2.0","method":"notifications/tools/progress","params":{"pct":50}}\n'
      printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[],"isError":false}}\n' "$id""#;
    let script = mock_script(INIT_REPLY, execute);
    let (events, mut events_rx) = broadcast::channel(64);
    let session = McpSession::new(
        &config("prog", &script, HashMap::new()),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();
    session
        .execute_tool("echo", json!({"text": "hi"}))
        .await
        .unwrap();

    let detail = loop {
        match events_rx.recv().await.unwrap() {
            McpEvent::ToolProgress { detail, .. } => break detail,
            _ => continue,
        }
    };
    assert_eq!(detail, json!({"pct": 50}));
    session.disconnect().await;
}

#[tokio::test]
async fn execution_error_carries_content() {
    let execute = r#"printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"boom"}],"isError":true}}\n' "$id""#;
    let script = mock_script(INIT_REPLY, execute);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("execerr", &script, HashMap::new()),
        Duration::from_secs(5),
        events,
    );
    session.connect().await.unwrap();

    match session.execute_tool("echo", json!({"text": "hi"})).await {
        Err(McpError::ToolExecution { content, .. }) => {
            assert_eq!(content[0]["text"], "boom");
        }
        other => panic!("expected ToolExecution, got {other:?}"),
    }
    session.disconnect().await;
}

#[tokio::test]
async fn handshake_rejection_is_a_handshake_error() {
    let init = r#"printf '{"jsonrpc":"2.0","id":"%s","error":{"code":-32600,"message":"unsupported client"}}\n' "$id""#;
    let script = mock_script(init, ECHO_REPLY);
    let (events, _) = broadcast::channel(64);
    let session = McpSession::new(
        &config("rejected", &script, HashMap::new()),
        Duration::from_secs(5),
        events,
    );

    match session.connect().await {
        Err(McpError::Protocol(e)) => assert!(e.to_string().contains("initialize rejected")),
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert!(!session.is_connected());
}
