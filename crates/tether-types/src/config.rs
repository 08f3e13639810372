//! Configuration types for MCP servers and the connection pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_keep_alive() -> bool {
    true
}

fn default_ready_delay_ms() -> u64 {
    100
}

fn default_grace_shutdown_ms() -> u64 {
    5000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    5000
}

/// Top-level configuration: the set of servers the runtime should know about.
///
/// Order is significant — tool lookup scans servers in the order they appear.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable unique identifier; also the request-id prefix for this server.
    pub id: String,
    /// Display name; falls back to `id` when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Which wire substrate to use and its parameters.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Override for the pool-level connect timeout.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Override for the pool-level per-request timeout.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Reconnection attempt budget (WebSocket).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for reconnection backoff in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Whether the server tolerates an overlapping connection during renewal.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
}

impl ServerConfig {
    /// The name to show in UIs and logs.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Connect timeout for this server, falling back to the pool default.
    pub fn connect_timeout(&self, pool: &PoolConfig) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(pool.connect_timeout_ms))
    }

    /// Per-request timeout for this server, falling back to the pool default.
    pub fn request_timeout(&self, pool: &PoolConfig) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(pool.request_timeout_ms))
    }
}

/// Transport selection plus transport-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Http(HttpConfig),
    Websocket(WebsocketConfig),
}

/// Child-process transport: newline-delimited JSON over stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables, merged over the host environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// How long to wait after spawn before checking the process is still up.
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
    /// SIGTERM-to-SIGKILL grace period on disconnect.
    #[serde(default = "default_grace_shutdown_ms")]
    pub grace_shutdown_ms: u64,
}

/// Request/response HTTP transport with optional server-sent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL; a trailing slash is stripped before use.
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// How to interpret the `/health` readiness probe.
    #[serde(default)]
    pub readiness: Readiness,
    /// Whether to open the `/events` server-push stream after connect.
    #[serde(default)]
    pub event_stream: bool,
}

/// Full-duplex WebSocket transport with heartbeats and reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// A pong must arrive within this window of each ping or the socket is dead.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
}

/// Readiness-probe interpretation for the HTTP transport.
///
/// Lenient mode accepts 404 as "reachable" so servers without a `/health`
/// endpoint still connect; strict mode requires a 2xx.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    #[default]
    Lenient,
    Strict,
}

/// Authentication applied to HTTP and WebSocket requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AuthConfig {
    Bearer { token: String },
    Header { name: String, value: String },
}

impl AuthConfig {
    /// The header this auth record contributes, as a `(name, value)` pair.
    pub fn header(&self) -> (String, String) {
        match self {
            AuthConfig::Bearer { token } => ("Authorization".into(), format!("Bearer {token}")),
            AuthConfig::Header { name, value } => (name.clone(), value.clone()),
        }
    }
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_max_use_count() -> u64 {
    1000
}

/// Knobs for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Fleet cap; overage triggers LRU eviction of a not-in-use session.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Sessions unused this long are disconnected by the idle sweeper.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Acquisitions past this count schedule a background renewal.
    #[serde(default = "default_max_use_count")]
    pub max_use_count: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_use_count: default_max_use_count(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Cadence of the idle sweeper.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis((self.idle_timeout_ms / 4).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stdio_server() {
        let toml_str = r#"
[[servers]]
id = "filesystem"
transport = "stdio"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/home/user"]
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.id, "filesystem");
        assert_eq!(server.display_name(), "filesystem");
        match &server.transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command, "npx");
                assert_eq!(stdio.args.len(), 3);
                assert_eq!(stdio.ready_delay_ms, 100);
                assert_eq!(stdio.grace_shutdown_ms, 5000);
            }
            other => panic!("expected stdio transport, got {other:?}"),
        }
        assert_eq!(server.max_retries, 5);
        assert!(server.keep_alive);
    }

    #[test]
    fn parse_http_server_with_auth() {
        let toml_str = r#"
[[servers]]
id = "search"
name = "Search Service"
transport = "http"
url = "https://tools.example.com/mcp/"
readiness = "strict"
headers = { "X-Team" = "infra" }

[servers.auth]
scheme = "bearer"
token = "tok-123"
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        let server = &config.servers[0];
        assert_eq!(server.display_name(), "Search Service");
        match &server.transport {
            TransportConfig::Http(http) => {
                assert_eq!(http.url, "https://tools.example.com/mcp/");
                assert_eq!(http.readiness, Readiness::Strict);
                assert!(!http.event_stream);
                assert_eq!(http.headers["X-Team"], "infra");
                let (name, value) = http.auth.as_ref().unwrap().header();
                assert_eq!(name, "Authorization");
                assert_eq!(value, "Bearer tok-123");
            }
            other => panic!("expected http transport, got {other:?}"),
        }
    }

    #[test]
    fn parse_websocket_server() {
        let toml_str = r#"
[[servers]]
id = "events"
transport = "websocket"
url = "wss://tools.example.com/ws"
max_retries = 3
retry_delay_ms = 500
ping_interval_ms = 10000
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        let server = &config.servers[0];
        assert_eq!(server.max_retries, 3);
        assert_eq!(server.retry_delay_ms, 500);
        match &server.transport {
            TransportConfig::Websocket(ws) => {
                assert_eq!(ws.ping_interval_ms, 10_000);
                assert_eq!(ws.pong_timeout_ms, 5000);
            }
            other => panic!("expected websocket transport, got {other:?}"),
        }
    }

    #[test]
    fn timeouts_fall_back_to_pool_defaults() {
        let toml_str = r#"
[[servers]]
id = "a"
transport = "stdio"
command = "cat"

[[servers]]
id = "b"
transport = "stdio"
command = "cat"
request_timeout_ms = 200
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        let pool = PoolConfig::default();
        assert_eq!(
            config.servers[0].request_timeout(&pool),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            config.servers[1].request_timeout(&pool),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn pool_config_defaults() {
        let pool: PoolConfig = toml::from_str("").unwrap();
        assert_eq!(pool.max_connections, 10);
        assert_eq!(pool.connect_timeout_ms, 30_000);
        assert_eq!(pool.idle_timeout_ms, 300_000);
        assert_eq!(pool.max_use_count, 1000);
        assert_eq!(pool.sweep_interval(), Duration::from_millis(75_000));
    }

    #[test]
    fn custom_auth_header() {
        let auth = AuthConfig::Header {
            name: "X-Api-Key".into(),
            value: "secret".into(),
        };
        assert_eq!(auth.header(), ("X-Api-Key".into(), "secret".into()));
    }

    #[test]
    fn default_config_is_empty() {
        let config = McpConfig::default();
        assert!(config.servers.is_empty());
    }
}
