//! JSON-RPC 2.0 framing for the Model Context Protocol stdio transport.
//!
//! Each frame is one JSON object on one line. Requests carry an `id` and get exactly
//! one response; notifications carry none and get no reply.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Protocol revisions this server can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Control channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::Parse(_) => PARSE_ERROR,
            ProtocolError::InvalidRequest(_) => INVALID_REQUEST,
            ProtocolError::MethodNotFound(_) => METHOD_NOT_FOUND,
            ProtocolError::InvalidParams(_) => INVALID_PARAMS,
            ProtocolError::Internal(_) | ProtocolError::Io(_) => INTERNAL_ERROR,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// A reply to something we sent; this server never sends requests, so these are dropped.
    Response,
}

pub fn parse_frame(line: &str) -> Result<Incoming, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    let Value::Object(mut frame) = value else {
        return Err(ProtocolError::InvalidRequest(
            "frame must be a JSON object".to_string(),
        ));
    };

    if frame.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(ProtocolError::InvalidRequest(
            "jsonrpc must be \"2.0\"".to_string(),
        ));
    }

    let params = frame
        .remove("params")
        .unwrap_or_else(|| Value::Object(Map::new()));
    let id = frame.remove("id");

    match frame.remove("method") {
        Some(Value::String(method)) => Ok(match id {
            Some(id) => Incoming::Request { id, method, params },
            None => Incoming::Notification { method, params },
        }),
        Some(_) => Err(ProtocolError::InvalidRequest(
            "method must be a string".to_string(),
        )),
        None if frame.contains_key("result") || frame.contains_key("error") => {
            Ok(Incoming::Response)
        }
        None => Err(ProtocolError::InvalidRequest("missing method".to_string())),
    }
}

/// The id of a frame we could not decode, if one is recoverable.
pub fn salvage_id(line: &str) -> Value {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|value| value.get("id").cloned())
        .unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &ProtocolError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcError {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }

    pub fn from_result(id: Value, result: Result<Value, ProtocolError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, &err),
        }
    }
}

/// Stable key for matching a cancellation to the request it names.
pub fn request_key(id: &Value) -> String {
    id.to_string()
}
