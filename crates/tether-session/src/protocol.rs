//! MCP protocol payload types.
//!
//! The envelope is typed strictly in `tether-wire`; the payloads here cover
//! the handshake and the discovery metadata. Tool results and resource
//! contents stay opaque `Value` trees — only the call sites that understand
//! them look inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version this client speaks.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Method names used on the wire.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_EXECUTE: &str = "tools/execute";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_GET: &str = "resources/get";
    pub const RESOURCES_WATCH: &str = "resources/watch";
    pub const RESOURCES_UNWATCH: &str = "resources/unwatch";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const PING: &str = "ping";
    pub const NOTIFY_LOG: &str = "notifications/log";
    pub const NOTIFY_RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIFY_TOOLS_PROGRESS: &str = "notifications/tools/progress";
}

/// Client identity sent during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

/// Build the `initialize` request parameters.
pub fn initialize_params() -> InitializeParams {
    InitializeParams {
        protocol_version: PROTOCOL_VERSION.into(),
        capabilities: serde_json::json!({}),
        client_info: ClientInfo {
            name: "tether".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
    }
}

/// Server identity from the `initialize` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// The `initialize` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
}

/// Capabilities the server advertised during the handshake.
///
/// Everything defaults to absent: an operation is allowed only when its
/// capability was explicitly advertised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<ToolsCapability>,
    #[serde(default)]
    pub resources: Option<ResourcesCapability>,
    #[serde(default)]
    pub prompts: Option<PromptsCapability>,
    #[serde(default)]
    pub logging: Option<Value>,
}

impl ServerCapabilities {
    pub fn can_list_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| t.list)
    }

    pub fn can_execute_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| t.execute)
    }

    pub fn can_list_resources(&self) -> bool {
        self.resources.as_ref().is_some_and(|r| r.list)
    }

    pub fn can_get_resources(&self) -> bool {
        self.resources.as_ref().is_some_and(|r| r.get)
    }

    pub fn can_watch_resources(&self) -> bool {
        self.resources.as_ref().is_some_and(|r| r.watch)
    }

    pub fn can_list_prompts(&self) -> bool {
        self.prompts.as_ref().is_some_and(|p| p.list)
    }

    pub fn can_get_prompts(&self) -> bool {
        self.prompts.as_ref().is_some_and(|p| p.get)
    }

    pub fn can_set_log_level(&self) -> bool {
        self.logging.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub execute: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesCapability {
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub get: bool,
    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsCapability {
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub get: bool,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// One tool from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolInfo>,
}

/// The `tools/execute` response payload; `content` stays opaque.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolExecuteResult {
    #[serde(default)]
    pub content: Value,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// One resource from `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesListResult {
    pub resources: Vec<ResourceInfo>,
}

/// The `resources/get` response payload; `contents` stays opaque.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceContentsResult {
    #[serde(default)]
    pub contents: Value,
}

/// One prompt from `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptsListResult {
    pub prompts: Vec<PromptInfo>,
}

/// Lenient shape of a `notifications/log` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}
