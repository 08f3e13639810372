//! The per-server MCP client session.
//!
//! State machine: Disconnected → Connecting → handshake (`initialize` +
//! `notifications/initialized`) → discovery (`tools/list`, `resources/list`,
//! and `prompts/list` when advertised) → Ready. Discovery failures are
//! non-fatal; transport failures tear the session down and fail every
//! pending request immediately.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tether_transport::{build_transport, ConnectionState, Transport, TransportEvent};
use tether_types::{McpError, McpEvent, ProtocolError, ServerConfig, TransportError};
use tether_wire::Notification;

use crate::protocol::{
    self, methods, InitializeResult, LogParams, PromptInfo, PromptsListResult,
    ResourceContentsResult, ResourceInfo, ResourcesListResult, ServerCapabilities, ServerInfo,
    ToolExecuteResult, ToolInfo, ToolsListResult,
};
use crate::rpc::RpcClient;
use crate::schema;

#[derive(Default)]
struct SessionState {
    /// True only between a successful handshake and the next teardown.
    initialized: bool,
    server_info: Option<ServerInfo>,
    capabilities: ServerCapabilities,
    tools: Vec<ToolInfo>,
    resources: Vec<ResourceInfo>,
    prompts: Vec<PromptInfo>,
}

/// Everything the background tasks share with the public handle.
struct SessionCore {
    server_id: String,
    rpc: RpcClient,
    transport: Arc<dyn Transport>,
    state: StdMutex<SessionState>,
    events: broadcast::Sender<McpEvent>,
}

/// One live MCP connection to one server.
pub struct McpSession {
    core: Arc<SessionCore>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for McpSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl SessionCore {
    fn emit(&self, event: McpEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.lock().capabilities.clone()
    }

    fn not_capable(&self, capability: &str) -> McpError {
        McpError::Protocol(ProtocolError::NotCapable {
            server: self.server_id.clone(),
            capability: capability.to_string(),
        })
    }

    /// Drop handshake state and caches; returns whether the session had
    /// completed its handshake.
    fn clear(&self) -> bool {
        let mut state = self.lock();
        let was_initialized = state.initialized;
        *state = SessionState::default();
        was_initialized
    }

    /// Fail every pending request with an error mirroring the transport's.
    fn fail_pending(&self, error: &TransportError) {
        match error {
            TransportError::ProcessExited { code, signal } => {
                let (code, signal) = (*code, *signal);
                self.rpc.fail_all(move || {
                    McpError::Transport(TransportError::ProcessExited { code, signal })
                });
            }
            TransportError::WriteFailed(detail) => {
                let detail = detail.clone();
                self.rpc.fail_all(move || {
                    McpError::Transport(TransportError::WriteFailed(detail.clone()))
                });
            }
            other => {
                let detail = other.to_string();
                self.rpc.fail_all(move || {
                    McpError::Transport(TransportError::UnexpectedClose(detail.clone()))
                });
            }
        }
    }

    /// `initialize`, `notifications/initialized`, then discovery.
    async fn handshake(&self) -> Result<(), McpError> {
        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| McpError::Protocol(e.into()))?;
        let value = match self.rpc.request(methods::INITIALIZE, Some(params)).await {
            Ok(value) => value,
            Err(McpError::Rpc { code, message, .. }) => {
                return Err(McpError::Protocol(ProtocolError::Handshake(format!(
                    "initialize rejected ({code}): {message}"
                ))));
            }
            Err(other) => return Err(other),
        };
        let result: InitializeResult = serde_json::from_value(value).map_err(|e| {
            McpError::Protocol(ProtocolError::Handshake(format!(
                "unparseable initialize response: {e}"
            )))
        })?;

        {
            let mut state = self.lock();
            state.initialized = true;
            state.server_info = Some(result.server_info.clone());
            state.capabilities = result.capabilities.clone();
        }

        // The initialized notification must follow the initialize response
        // and precede any discovery request.
        self.rpc.notify(methods::INITIALIZED, None).await?;
        self.discover().await;

        tracing::info!(
            server_id = %self.server_id,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "session ready"
        );
        self.emit(McpEvent::ConnectionInitialized {
            server_id: self.server_id.clone(),
            server_name: result.server_info.name,
            server_version: result.server_info.version,
            protocol_version: result.protocol_version,
        });
        Ok(())
    }

    /// Bulk-load tools and resources in parallel; either side may fail
    /// without keeping the session out of Ready. Prompts are fetched only
    /// when the server advertised them.
    async fn discover(&self) {
        let (tools, resources) = tokio::join!(self.refresh_tools(), self.refresh_resources());
        if let Err(e) = tools {
            tracing::warn!(server_id = %self.server_id, error = %e, "tool discovery failed");
        }
        if let Err(e) = resources {
            tracing::warn!(server_id = %self.server_id, error = %e, "resource discovery failed");
        }
        if self.capabilities().can_list_prompts() {
            if let Err(e) = self.refresh_prompts().await {
                tracing::warn!(server_id = %self.server_id, error = %e, "prompt discovery failed");
            }
        }
    }

    async fn refresh_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let value = self.rpc.request(methods::TOOLS_LIST, None).await?;
        let result: ToolsListResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol(e.into()))?;
        self.lock().tools = result.tools.clone();
        Ok(result.tools)
    }

    async fn refresh_resources(&self) -> Result<Vec<ResourceInfo>, McpError> {
        let value = self.rpc.request(methods::RESOURCES_LIST, None).await?;
        let result: ResourcesListResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol(e.into()))?;
        self.lock().resources = result.resources.clone();
        Ok(result.resources)
    }

    async fn refresh_prompts(&self) -> Result<Vec<PromptInfo>, McpError> {
        let value = self.rpc.request(methods::PROMPTS_LIST, None).await?;
        let result: PromptsListResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol(e.into()))?;
        self.lock().prompts = result.prompts.clone();
        Ok(result.prompts)
    }

    fn forward_log(&self, notification: Notification) {
        let params: LogParams = notification
            .params
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();
        let message = params
            .message
            .or_else(|| params.data.map(|d| d.to_string()))
            .unwrap_or_default();
        match params.level.as_deref() {
            Some("error") => tracing::error!(server_id = %self.server_id, "server log: {message}"),
            Some("warning") | Some("warn") => {
                tracing::warn!(server_id = %self.server_id, "server log: {message}")
            }
            Some("debug") => tracing::debug!(server_id = %self.server_id, "server log: {message}"),
            _ => tracing::info!(server_id = %self.server_id, "server log: {message}"),
        }
    }
}

/// Consume transport events: feed the correlator, react to failures.
async fn run_dispatch(
    core: Arc<SessionCore>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(frame) => core.rpc.dispatch(frame),
            TransportEvent::Malformed(_) => {
                // Already logged at the transport; nothing else to do.
            }
            TransportEvent::Error(error) => {
                core.fail_pending(&error);
                let was_initialized = core.clear();
                let detail = error.to_string();
                if was_initialized {
                    core.emit(McpEvent::ConnectionLost {
                        server_id: core.server_id.clone(),
                        detail,
                    });
                } else {
                    core.emit(McpEvent::ConnectionError {
                        server_id: core.server_id.clone(),
                        detail,
                    });
                }
            }
            TransportEvent::StateChanged { from, to } => {
                tracing::debug!(
                    server_id = %core.server_id,
                    %from,
                    %to,
                    "connection state changed"
                );
                if matches!(
                    to,
                    ConnectionState::Disconnected | ConnectionState::Error
                ) {
                    let server = core.server_id.clone();
                    core.rpc
                        .fail_all(move || McpError::NotConnected {
                            server: server.clone(),
                        });
                    core.clear();
                }
            }
            TransportEvent::Reconnected { attempts } => {
                core.emit(McpEvent::Reconnected {
                    server_id: core.server_id.clone(),
                    attempts,
                });
                // A fresh socket is a fresh protocol session.
                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    if let Err(e) = core.handshake().await {
                        tracing::warn!(
                            server_id = %core.server_id,
                            error = %e,
                            "re-handshake after reconnect failed"
                        );
                    }
                });
            }
        }
    }
}

/// Consume server-initiated notifications from the correlator's fan-out.
async fn run_notifications(
    core: Arc<SessionCore>,
    mut fallback: mpsc::UnboundedReceiver<Notification>,
) {
    let mut log_rx = core.rpc.subscribe(methods::NOTIFY_LOG);
    let mut updated_rx = core.rpc.subscribe(methods::NOTIFY_RESOURCES_UPDATED);
    let mut progress_rx = core.rpc.subscribe(methods::NOTIFY_TOOLS_PROGRESS);

    loop {
        tokio::select! {
            Some(notification) = log_rx.recv() => core.forward_log(notification),
            Some(_) = updated_rx.recv() => {
                if core.capabilities().can_list_resources() {
                    let core = Arc::clone(&core);
                    tokio::spawn(async move {
                        if let Err(e) = core.refresh_resources().await {
                            tracing::debug!(
                                server_id = %core.server_id,
                                error = %e,
                                "resource re-discovery failed"
                            );
                        }
                    });
                }
            }
            Some(notification) = progress_rx.recv() => {
                core.emit(McpEvent::ToolProgress {
                    server_id: core.server_id.clone(),
                    detail: notification.params.unwrap_or(Value::Null),
                });
            }
            Some(notification) = fallback.recv() => {
                tracing::debug!(
                    server_id = %core.server_id,
                    method = %notification.method,
                    "unhandled server notification"
                );
            }
            else => break,
        }
    }
}

impl McpSession {
    /// Build a session around a freshly constructed transport.
    ///
    /// Nothing touches the wire until [`connect`](Self::connect).
    pub fn new(
        config: &ServerConfig,
        request_timeout: Duration,
        events: broadcast::Sender<McpEvent>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = build_transport(config, event_tx);
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        let rpc = RpcClient::new(
            &config.id,
            Arc::clone(&transport),
            request_timeout,
            fallback_tx,
        );

        let core = Arc::new(SessionCore {
            server_id: config.id.clone(),
            rpc,
            transport,
            state: StdMutex::new(SessionState::default()),
            events,
        });

        let tasks = vec![
            tokio::spawn(run_dispatch(Arc::clone(&core), event_rx)),
            tokio::spawn(run_notifications(Arc::clone(&core), fallback_rx)),
        ];

        Self { core, tasks }
    }

    pub fn server_id(&self) -> &str {
        &self.core.server_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.transport.state()
    }

    /// Connected transport plus completed handshake.
    pub fn is_connected(&self) -> bool {
        self.core.transport.state() == ConnectionState::Connected && self.core.lock().initialized
    }

    /// What the server reported during the handshake, if any.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.core.lock().server_info.clone()
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.core.capabilities()
    }

    fn ensure_connected(&self) -> Result<(), McpError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(McpError::NotConnected {
                server: self.core.server_id.clone(),
            })
        }
    }

    /// Connect the transport, run the handshake, populate the caches.
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.is_connected() {
            return Ok(());
        }
        self.core.transport.connect().await.map_err(McpError::from)?;
        if let Err(e) = self.core.handshake().await {
            // Half-open sessions are useless; tear the transport back down.
            self.core.transport.disconnect().await;
            self.core.clear();
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort teardown; never fails, safe to repeat.
    pub async fn disconnect(&self) {
        self.core.transport.disconnect().await;
        let server = self.core.server_id.clone();
        self.core.rpc.fail_all(move || McpError::NotConnected {
            server: server.clone(),
        });
        self.core.clear();
    }

    /// Cached tool list, fetched fresh only when the cache is empty.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_list_tools() {
            return Err(self.core.not_capable("tools.list"));
        }
        let cached = self.core.lock().tools.clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.core.refresh_tools().await
    }

    /// Cached resource list, fetched fresh only when the cache is empty.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_list_resources() {
            return Err(self.core.not_capable("resources.list"));
        }
        let cached = self.core.lock().resources.clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.core.refresh_resources().await
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>, McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_list_prompts() {
            return Err(self.core.not_capable("prompts.list"));
        }
        let cached = self.core.lock().prompts.clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.core.refresh_prompts().await
    }

    /// Run a tool. The name must be in the discovered tool cache — unknown
    /// names are rejected here, never round-tripped to the server — and the
    /// arguments must pass the tool's input schema.
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_execute_tools() {
            return Err(self.core.not_capable("tools.execute"));
        }
        let tool = {
            let state = self.core.lock();
            state.tools.iter().find(|t| t.name == name).cloned()
        }
        .ok_or_else(|| McpError::ToolNotFound {
            server: self.core.server_id.clone(),
            name: name.to_string(),
        })?;

        let issues = schema::validate_arguments(&tool.input_schema, &arguments);
        if !issues.is_empty() {
            return Err(McpError::ArgSchema {
                tool: name.to_string(),
                issues,
            });
        }

        let value = self
            .core
            .rpc
            .request(
                methods::TOOLS_EXECUTE,
                Some(json!({"name": name, "arguments": arguments})),
            )
            .await?;
        let result: ToolExecuteResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol(e.into()))?;
        if result.is_error {
            return Err(McpError::ToolExecution {
                server: self.core.server_id.clone(),
                tool: name.to_string(),
                content: result.content,
            });
        }
        Ok(result.content)
    }

    pub async fn get_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_get_resources() {
            return Err(self.core.not_capable("resources.get"));
        }
        let value = self
            .core
            .rpc
            .request(methods::RESOURCES_GET, Some(json!({"uri": uri})))
            .await?;
        let result: ResourceContentsResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol(e.into()))?;
        Ok(result.contents)
    }

    pub async fn watch_resource(&self, uri: &str) -> Result<(), McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_watch_resources() {
            return Err(self.core.not_capable("resources.watch"));
        }
        self.core
            .rpc
            .request(methods::RESOURCES_WATCH, Some(json!({"uri": uri})))
            .await?;
        Ok(())
    }

    pub async fn unwatch_resource(&self, uri: &str) -> Result<(), McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_watch_resources() {
            return Err(self.core.not_capable("resources.watch"));
        }
        self.core
            .rpc
            .request(methods::RESOURCES_UNWATCH, Some(json!({"uri": uri})))
            .await?;
        Ok(())
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_get_prompts() {
            return Err(self.core.not_capable("prompts.get"));
        }
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.core
            .rpc
            .request(methods::PROMPTS_GET, Some(params))
            .await
    }

    pub async fn set_log_level(&self, level: &str) -> Result<(), McpError> {
        self.ensure_connected()?;
        if !self.core.capabilities().can_set_log_level() {
            return Err(self.core.not_capable("logging"));
        }
        self.core
            .rpc
            .request(methods::LOGGING_SET_LEVEL, Some(json!({"level": level})))
            .await?;
        Ok(())
    }

    /// Liveness probe; every failure coalesces to `false`.
    pub async fn ping(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.core.rpc.request(methods::PING, None).await.is_ok()
    }

    /// Re-run discovery on an already-connected session.
    pub async fn refresh(&self) -> Result<(), McpError> {
        self.ensure_connected()?;
        self.core.discover().await;
        Ok(())
    }

    /// Requests currently awaiting a response; exposed for the pool's
    /// bookkeeping and for tests.
    pub fn pending_requests(&self) -> usize {
        self.core.rpc.pending_count()
    }
}
