// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC 2.0 framing for line-oriented transports (stdio, WebSocket).
//!
//! The codec assigns request ids; correlation of responses back to waiters
//! is the owning adapter's job.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// One JSON-RPC 2.0 frame: request, notification, response, or error
/// response, depending on which fields are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcMessage {
    /// Whether this frame is a request (has both `method` and `id`).
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    /// Whether this frame is a notification (`method` without `id`).
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Whether this frame is a response (no `method`, has `id`).
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// Integer id, when present and integral.
    pub fn id_i64(&self) -> Option<i64> {
        self.id.as_ref().and_then(|v| v.as_i64())
    }
}

/// Method-not-supported error code mandated by JSON-RPC 2.0.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Stateful JSON-RPC 2.0 codec: assigns strictly increasing integer request
/// ids starting at 1 and frames messages as single lines.
#[derive(Debug)]
pub struct JsonRpcCodec {
    next_id: AtomicI64,
}

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self { next_id: AtomicI64::new(1) }
    }

    /// Build a request with a freshly assigned id. Returns `(id, message)`.
    pub fn create_request(&self, method: &str, params: Value) -> (i64, JsonRpcMessage) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = JsonRpcMessage {
            jsonrpc: "2.0".to_owned(),
            id: Some(Value::from(id)),
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
        };
        (id, msg)
    }

    /// Build a notification (no id, no response expected).
    pub fn create_notification(&self, method: &str, params: Value) -> JsonRpcMessage {
        JsonRpcMessage {
            jsonrpc: "2.0".to_owned(),
            id: None,
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a success response for a peer-assigned id.
    pub fn create_response(&self, id: Value, result: Value) -> JsonRpcMessage {
        JsonRpcMessage {
            jsonrpc: "2.0".to_owned(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for a peer-assigned id.
    pub fn create_error_response(&self, id: Value, code: i64, message: &str) -> JsonRpcMessage {
        JsonRpcMessage {
            jsonrpc: "2.0".to_owned(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError { code, message: message.to_owned(), data: None }),
        }
    }

    /// Serialize a frame as one newline-terminated line.
    pub fn encode(&self, msg: &JsonRpcMessage) -> Result<String, Error> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line into a frame.
    ///
    /// Rejects empty lines, non-JSON input, and frames whose `jsonrpc`
    /// field is anything other than `"2.0"`.
    pub fn decode(&self, line: &str) -> Result<JsonRpcMessage, Error> {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.trim().is_empty() {
            return Err(Error::Protocol("empty message".to_owned()));
        }
        let msg: JsonRpcMessage = serde_json::from_str(trimmed)
            .map_err(|e| Error::Protocol(format!("invalid JSON-RPC: {e}")))?;
        if msg.jsonrpc != "2.0" {
            return Err(Error::Protocol(format!(
                "invalid JSON-RPC: unsupported version {:?}",
                msg.jsonrpc
            )));
        }
        Ok(msg)
    }
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "jsonrpc_tests.rs"]
mod tests;
