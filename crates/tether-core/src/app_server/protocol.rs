//! JSON-RPC 2.0 framing for the app-server stdio protocol.
//!
//! One JSON object per line. Requests carry an integer id, notifications
//! omit it, and the server may send its own id-bearing requests which must
//! be answered.

use serde_json::{Map, Value, json};
use thiserror::Error;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_THREAD_START: &str = "thread/start";
pub const METHOD_TURN_START: &str = "turn/start";
pub const METHOD_TURN_STEER: &str = "turn/steer";

/// JSON-RPC "method not found" code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error object returned by the app-server in place of a result.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{method} failed with code {code}: {message}")]
pub struct RpcError {
    pub method: String,
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    fn from_value(method: &str, error: &Value) -> Self {
        Self {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: error.get("data").cloned(),
        }
    }
}

/// A message read from the app-server, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to one of our requests.
    Response {
        id: u64,
        outcome: Result<Value, Value>,
    },
    /// Request initiated by the server; `id` is echoed back verbatim.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Incoming {
    /// Classifies a decoded line. Returns `None` for objects that are
    /// neither requests, responses nor notifications.
    pub fn classify(mut value: Value) -> Option<Self> {
        let object = value.as_object_mut()?;
        let id = object.remove("id").filter(|id| !id.is_null());
        let params = object.remove("params").unwrap_or(Value::Null);

        if let Some(method) = object.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return Some(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        let id = id.as_ref().and_then(response_id)?;
        if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
            return Some(Self::Response {
                id,
                outcome: Err(error),
            });
        }
        let result = object.remove("result").unwrap_or(Value::Null);
        Some(Self::Response {
            id,
            outcome: Ok(result),
        })
    }
}

/// Our request ids are integers; tolerate servers that echo them as strings.
fn response_id(id: &Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Converts an error payload from a response into a typed error.
pub fn rpc_error(method: &str, error: &Value) -> RpcError {
    RpcError::from_value(method, error)
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = Map::new();
    message.insert("jsonrpc".to_string(), json!("2.0"));
    message.insert("method".to_string(), json!(method));
    if let Some(params) = params {
        message.insert("params".to_string(), params);
    }
    Value::Object(message)
}

pub fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Canonicalizes a method name to lowercase snake_case.
///
/// Path separators (`/`, `.`), dashes and camelCase boundaries all become
/// single underscores, so `item/agentMessage/delta`,
/// `item/agent_message/delta` and `item_agent_message_delta` compare equal.
pub fn normalize_method(method: &str) -> String {
    let mut out = String::with_capacity(method.len() + 8);
    let mut prev: Option<char> = None;
    for ch in method.trim().chars() {
        if matches!(ch, '/' | '.' | '-' | '_' | ' ') {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev = Some('_');
            continue;
        }
        if ch.is_uppercase() {
            let boundary = prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit());
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
        prev = Some(ch);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
