//! Encoding, decoding, and structural validation of JSON-RPC frames.
//!
//! Classification rules: a frame must carry `jsonrpc: "2.0"` and match
//! exactly one of request (`method` + `id`), notification (`method`, no
//! `id`), or response (`id` + exactly one of `result`/`error`). Anything
//! else is a malformed frame, which callers drop with an error event rather
//! than tearing down the session.

use serde_json::Value;

use crate::frame::{ErrorObject, Frame, Notification, Request, RequestId, Response};
use tether_types::ProtocolError;

/// Encode one frame as a compact JSON string (no trailing newline).
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Encode a batch as a JSON array, for transports that support it.
pub fn encode_batch(frames: &[Frame]) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frames)?)
}

/// Decode a single frame from one line or one text frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid JSON: {e}")))?;
    classify(value)
}

/// Decode an HTTP body: either a single frame object or a batch array.
///
/// The outer `Result` fails only when the body itself is not JSON; individual
/// frames within a batch fail independently so one bad element does not
/// discard its siblings.
pub fn decode_body(body: &str) -> Result<Vec<Result<Frame, ProtocolError>>, ProtocolError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid JSON body: {e}")))?;
    match value {
        Value::Array(items) => Ok(items.into_iter().map(classify).collect()),
        other => Ok(vec![classify(other)]),
    }
}

/// Classify a JSON value as a request, response, or notification.
pub fn classify(value: Value) -> Result<Frame, ProtocolError> {
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::MalformedFrame("frame is not an object".into()));
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == "2.0" => {}
        Some(other) => {
            return Err(ProtocolError::MalformedFrame(format!(
                "jsonrpc must be \"2.0\", got {other}"
            )));
        }
        None => {
            return Err(ProtocolError::MalformedFrame("missing jsonrpc field".into()));
        }
    }

    let id = match obj.remove("id") {
        None => None,
        Some(Value::String(s)) => Some(RequestId::String(s)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(RequestId::Number(i)),
            None => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "id must be an integer or string, got {n}"
                )));
            }
        },
        Some(other) => {
            return Err(ProtocolError::MalformedFrame(format!(
                "id must be a string or number, got {other}"
            )));
        }
    };

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(other) => {
            return Err(ProtocolError::MalformedFrame(format!(
                "method must be a string, got {other}"
            )));
        }
    };

    let result = obj.remove("result");
    let error = obj.remove("error");
    let has_payload = result.is_some() || error.is_some();

    match (method, id) {
        // Request or notification; a result/error member makes it ambiguous.
        (Some(_), _) if has_payload => Err(ProtocolError::MalformedFrame(
            "frame has both method and result/error".into(),
        )),
        (Some(method), Some(id)) => Ok(Frame::Request(Request {
            jsonrpc: "2.0",
            id,
            method,
            params: obj.remove("params"),
        })),
        (Some(method), None) => Ok(Frame::Notification(Notification {
            jsonrpc: "2.0",
            method,
            params: obj.remove("params"),
        })),
        (None, Some(id)) => {
            let error = match error {
                Some(e) => Some(parse_error_object(e)?),
                None => None,
            };
            match (result, error) {
                (Some(_), Some(_)) => Err(ProtocolError::MalformedFrame(
                    "response has both result and error".into(),
                )),
                (None, None) => Err(ProtocolError::MalformedFrame(
                    "response has neither result nor error".into(),
                )),
                (result, error) => Ok(Frame::Response(Response {
                    jsonrpc: "2.0",
                    id,
                    result,
                    error,
                })),
            }
        }
        (None, None) => Err(ProtocolError::MalformedFrame(
            "frame has neither method nor id".into(),
        )),
    }
}

fn parse_error_object(value: Value) -> Result<ErrorObject, ProtocolError> {
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::MalformedFrame("error is not an object".into()));
    };

    let code = match obj.get("code") {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
            ProtocolError::MalformedFrame(format!("error.code must be an integer, got {n}"))
        })?,
        other => {
            return Err(ProtocolError::MalformedFrame(format!(
                "error.code must be an integer, got {other:?}"
            )));
        }
    };

    let message = match obj.remove("message") {
        Some(Value::String(m)) if !m.is_empty() => m,
        _ => {
            return Err(ProtocolError::MalformedFrame(
                "error.message must be a non-empty string".into(),
            ));
        }
    };

    Ok(ErrorObject {
        code,
        message,
        data: obj.remove("data"),
    })
}
