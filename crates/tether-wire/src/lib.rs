//! JSON-RPC 2.0 wire layer for the tether MCP client runtime.
//!
//! Frames are UTF-8 JSON, one per output unit: one line for stdio, one body
//! for HTTP, one text frame for WebSocket. The codec classifies every inbound
//! value as a request, response, or notification and rejects anything that
//! violates the envelope rules as a malformed frame.

pub mod codec;
pub mod frame;

pub use codec::{decode, decode_body, encode, encode_batch};
pub use frame::{ErrorObject, Frame, Notification, Request, RequestId, Response};
