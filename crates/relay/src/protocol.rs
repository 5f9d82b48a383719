// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consumer WebSocket message types.
//!
//! Both directions are internally-tagged JSON enums (`{"type": "...", ...}`).
//! Outbound frames additionally carry a per-session monotonic `seq`, stamped
//! by the broadcaster at send time rather than here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::permission::PermissionBehavior;

/// Inbound image attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub media_type: String,
    /// Base64 payload.
    pub data: String,
}

/// Frames a consumer may send to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    UserMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImagePayload>>,
    },
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Interrupt {},
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
    },
    SlashCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    QueueMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImagePayload>>,
    },
    UpdateQueuedMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImagePayload>>,
    },
    CancelQueuedMessage {},
    PresenceQuery {},
    SetAdapter {
        adapter: String,
    },
}

impl InboundMessage {
    /// Wire tag, for metrics and the command → unified-type map.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::PermissionResponse { .. } => "permission_response",
            Self::Interrupt {} => "interrupt",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SlashCommand { .. } => "slash_command",
            Self::QueueMessage { .. } => "queue_message",
            Self::UpdateQueuedMessage { .. } => "update_queued_message",
            Self::CancelQueuedMessage {} => "cancel_queued_message",
            Self::PresenceQuery {} => "presence_query",
            Self::SetAdapter { .. } => "set_adapter",
        }
    }
}

/// One consumer as other consumers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
}

/// Frames the gateway sends to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerMessage {
    Identity {
        user_id: String,
        display_name: String,
        role: String,
    },
    SessionInit {
        session: Value,
    },
    MessageHistory {
        messages: Vec<Value>,
    },
    UserMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImagePayload>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    },
    Assistant {
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    Result {
        data: Value,
    },
    StreamEvent {
        event: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    PermissionRequest {
        request: Value,
    },
    ToolProgress {
        progress: Value,
    },
    ToolUseSummary {
        summary: Value,
    },
    AuthStatus {
        status: Value,
    },
    StatusChange {
        status: String,
    },
    Interrupt {},
    CliConnected {},
    CliDisconnected {},
    PresenceUpdate {
        consumers: Vec<PresenceEntry>,
        count: usize,
    },
    MessageQueued {
        content: String,
        author: String,
    },
    QueuedMessageUpdated {
        content: String,
        author: String,
    },
    QueuedMessageCancelled {},
    QueuedMessageSent {
        content: String,
    },
    SlashCommandResult {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        source: String,
        content: String,
    },
    SlashCommandError {
        error: String,
    },
    Error {
        message: String,
    },
}

impl ConsumerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity",
            Self::SessionInit { .. } => "session_init",
            Self::MessageHistory { .. } => "message_history",
            Self::UserMessage { .. } => "user_message",
            Self::Assistant { .. } => "assistant",
            Self::Result { .. } => "result",
            Self::StreamEvent { .. } => "stream_event",
            Self::PermissionRequest { .. } => "permission_request",
            Self::ToolProgress { .. } => "tool_progress",
            Self::ToolUseSummary { .. } => "tool_use_summary",
            Self::AuthStatus { .. } => "auth_status",
            Self::StatusChange { .. } => "status_change",
            Self::Interrupt {} => "interrupt",
            Self::CliConnected {} => "cli_connected",
            Self::CliDisconnected {} => "cli_disconnected",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::MessageQueued { .. } => "message_queued",
            Self::QueuedMessageUpdated { .. } => "queued_message_updated",
            Self::QueuedMessageCancelled {} => "queued_message_cancelled",
            Self::QueuedMessageSent { .. } => "queued_message_sent",
            Self::SlashCommandResult { .. } => "slash_command_result",
            Self::SlashCommandError { .. } => "slash_command_error",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
