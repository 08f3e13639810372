//! JSON-RPC 2.0 frame types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC request id: string or number.
///
/// Outbound ids are always strings of the form `<server-id>-<counter>`;
/// the numeric form exists because servers may use it in their own frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A request: carries an id and expects a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A notification: fire-and-forget, no id, no response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// A response: carries the id of the request it answers and exactly one of
/// `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Unwrap into the result payload or the server's error object.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// The error member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// One frame on the wire, classified.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Frame {
    /// The method, for request and notification frames.
    pub fn method(&self) -> Option<&str> {
        match self {
            Frame::Request(r) => Some(&r.method),
            Frame::Notification(n) => Some(&n.method),
            Frame::Response(_) => None,
        }
    }

    /// The id, for request and response frames.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Frame::Request(r) => Some(&r.id),
            Frame::Response(r) => Some(&r.id),
            Frame::Notification(_) => None,
        }
    }
}
