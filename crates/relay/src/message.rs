// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified message envelope shared by every adapter and consumer path.
//!
//! Each backend's wire format is translated into [`UnifiedMessage`] on the
//! way in and out of the gateway. The envelope is immutable once built;
//! translators construct a fresh one per wire event.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of message kinds understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedType {
    SessionInit,
    StatusChange,
    Assistant,
    Result,
    StreamEvent,
    PermissionRequest,
    ControlResponse,
    ToolProgress,
    ToolUseSummary,
    AuthStatus,
    UserMessage,
    PermissionResponse,
    Interrupt,
    ConfigurationChange,
    Unknown,
}

impl UnifiedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInit => "session_init",
            Self::StatusChange => "status_change",
            Self::Assistant => "assistant",
            Self::Result => "result",
            Self::StreamEvent => "stream_event",
            Self::PermissionRequest => "permission_request",
            Self::ControlResponse => "control_response",
            Self::ToolProgress => "tool_progress",
            Self::ToolUseSummary => "tool_use_summary",
            Self::AuthStatus => "auth_status",
            Self::UserMessage => "user_message",
            Self::PermissionResponse => "permission_response",
            Self::Interrupt => "interrupt",
            Self::ConfigurationChange => "configuration_change",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a wire string into a type tag. Unrecognized strings are `None`
    /// (callers decide between erroring and mapping to [`UnifiedType::Unknown`]).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "session_init" => Self::SessionInit,
            "status_change" => Self::StatusChange,
            "assistant" => Self::Assistant,
            "result" => Self::Result,
            "stream_event" => Self::StreamEvent,
            "permission_request" => Self::PermissionRequest,
            "control_response" => Self::ControlResponse,
            "tool_progress" => Self::ToolProgress,
            "tool_use_summary" => Self::ToolUseSummary,
            "auth_status" => Self::AuthStatus,
            "user_message" => Self::UserMessage,
            "permission_response" => Self::PermissionResponse,
            "interrupt" => Self::Interrupt,
            "configuration_change" => Self::ConfigurationChange,
            "unknown" => Self::Unknown,
            _ => return None,
        })
    }
}

impl fmt::Display for UnifiedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a message speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "tool" => Self::Tool,
            _ => return None,
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base64 image payload carried inside an [`UnifiedContent::Image`] block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    pub media_type: String,
    pub data: String,
}

/// One block of message content. Tagged union, not inheritance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Code {
        language: String,
        code: String,
    },
    Image {
        source: ImageSource,
    },
    Thinking {
        thinking: String,
    },
}

/// Canonical envelope normalized from every backend wire format.
///
/// `metadata` is an open map carrying per-type details (backend session
/// ids, model names, usage counters, raw wire events, permission options).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: UnifiedType,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<UnifiedContent>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl UnifiedMessage {
    /// Build a message with a fresh UUID and the current wall-clock time.
    pub fn new(kind: UnifiedType, role: Role) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_epoch_ms(),
            kind,
            role,
            content: Vec::new(),
            metadata: Map::new(),
            parent_id: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(UnifiedContent::Text { text: text.into() });
        self
    }

    pub fn with_content(mut self, block: UnifiedContent) -> Self {
        self.content.push(block);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Concatenated text of all `text` blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let UnifiedContent::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// String-valued metadata lookup.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Runtime shape guard for untyped JSON claiming to be a unified message.
///
/// Rejects: missing/empty `id`, missing or non-finite `timestamp`, unknown
/// `type` or `role`, non-array `content`, and non-object `metadata`.
pub fn is_unified_message(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if !obj.get("id").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty()) {
        return false;
    }
    match obj.get("timestamp") {
        Some(ts) if ts.is_u64() || ts.is_i64() => {}
        Some(ts) if ts.as_f64().is_some_and(f64::is_finite) => {}
        _ => return false,
    }
    if !obj
        .get("type")
        .and_then(|v| v.as_str())
        .is_some_and(|s| UnifiedType::from_str_opt(s).is_some())
    {
        return false;
    }
    if !obj
        .get("role")
        .and_then(|v| v.as_str())
        .is_some_and(|s| Role::from_str_opt(s).is_some())
    {
        return false;
    }
    match obj.get("content") {
        None | Some(Value::Array(_)) => {}
        _ => return false,
    }
    match obj.get("metadata") {
        None | Some(Value::Object(_)) => {}
        _ => return false,
    }
    true
}

/// Deterministic JSON serialization: object keys sorted recursively, so two
/// structurally equal values always produce the same bytes. Used for
/// tracing and dedup, never on the wire.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Map a backend CLI wire type tag to the unified type it normalizes to.
///
/// Tags with no mapping come back as [`UnifiedType::Unknown`] so pumps can
/// keep going without special cases.
pub fn unified_type_for_wire(wire_type: &str) -> UnifiedType {
    match wire_type {
        "system:init" => UnifiedType::SessionInit,
        "system:status" => UnifiedType::StatusChange,
        "assistant" => UnifiedType::Assistant,
        "result" => UnifiedType::Result,
        "stream_event" => UnifiedType::StreamEvent,
        "control_request" => UnifiedType::PermissionRequest,
        "control_response" => UnifiedType::ControlResponse,
        "tool_progress" => UnifiedType::ToolProgress,
        "tool_use_summary" => UnifiedType::ToolUseSummary,
        "auth_status" => UnifiedType::AuthStatus,
        "user" => UnifiedType::UserMessage,
        "keep_alive" => UnifiedType::Unknown,
        _ => UnifiedType::Unknown,
    }
}

/// Map an inbound consumer command tag to the unified type sent backend-ward.
pub fn unified_type_for_command(command: &str) -> UnifiedType {
    match command {
        "user_message" | "queue_message" => UnifiedType::UserMessage,
        "interrupt" => UnifiedType::Interrupt,
        "permission_response" => UnifiedType::PermissionResponse,
        "set_model" | "set_permission_mode" => UnifiedType::ConfigurationChange,
        _ => UnifiedType::Unknown,
    }
}

/// Monotonic per-session sequence stamper. Sequence numbers start at 1 and
/// never repeat or regress for the lifetime of the session, including
/// across history-ring trims.
#[derive(Debug)]
pub struct MessageSequencer {
    next: AtomicU64,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Take the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The sequence number the next call to [`next_seq`] will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for MessageSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Current UTC time as milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
