// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlates agent-initiated permission prompts with consumer responses.
//!
//! The agent side awaits a decision; the consumer side answers with a
//! request id at some later point, or never. The bridge holds one waiter
//! per in-flight request and guarantees each resolves exactly once.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::message::{now_epoch_ms, Role, UnifiedMessage, UnifiedType};

/// Default time a prompt may stay unanswered before auto-deny.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

impl PermissionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// The agent-facing outcome of one permission prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self { behavior: PermissionBehavior::Allow, updated_input: None, message: None }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }
}

/// Optional context attached to a tool request by the calling adapter.
#[derive(Debug, Clone, Default)]
pub struct ToolRequestContext {
    pub tool_use_id: Option<String>,
    pub agent_id: Option<String>,
    pub blocked_path: Option<String>,
    pub decision_reason: Option<String>,
    pub suggestions: Option<Value>,
}

/// Bridge between "agent awaits a decision" and "consumer responds by id".
pub struct PermissionBridge {
    waiters: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
    request_tx: mpsc::Sender<UnifiedMessage>,
    timeout: Duration,
}

impl PermissionBridge {
    /// `request_tx` receives the `permission_request` message emitted for
    /// each tool request (the owning adapter pushes it into its stream).
    pub fn new(request_tx: mpsc::Sender<UnifiedMessage>) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            request_tx,
            timeout: DEFAULT_PERMISSION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the consumers for a tool-use decision and await it.
    ///
    /// Emits a `permission_request` unified message, then blocks the agent
    /// path until a response, `cancel_all`, or the timeout resolves the
    /// waiter. Timing out resolves with deny.
    pub async fn handle_tool_request(
        &self,
        tool_name: &str,
        input: Value,
        ctx: ToolRequestContext,
    ) -> PermissionDecision {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id.clone(), tx);

        let timestamp = now_epoch_ms();
        let mut msg = UnifiedMessage::new(UnifiedType::PermissionRequest, Role::System)
            .with_meta("request_id", json!(request_id))
            .with_meta("tool_name", json!(tool_name))
            .with_meta("input", input)
            .with_meta("requested_at", json!(timestamp))
            .with_meta("expires_at", json!(timestamp + self.timeout.as_millis() as u64));
        if let Some(tool_use_id) = &ctx.tool_use_id {
            msg = msg.with_meta("tool_use_id", json!(tool_use_id));
        }
        if let Some(agent_id) = &ctx.agent_id {
            msg = msg.with_meta("agent_id", json!(agent_id));
        }
        if let Some(blocked_path) = &ctx.blocked_path {
            msg = msg.with_meta("blocked_path", json!(blocked_path));
        }
        if let Some(reason) = &ctx.decision_reason {
            msg = msg.with_meta("decision_reason", json!(reason));
        }
        if let Some(suggestions) = &ctx.suggestions {
            msg = msg.with_meta("suggestions", suggestions.clone());
        }
        let _ = self.request_tx.send(msg).await;

        tokio::select! {
            decision = rx => {
                decision.unwrap_or_else(|_| PermissionDecision::deny("Session closed"))
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.waiters.lock().await.remove(&request_id);
                debug!(request_id, tool_name, "permission request timed out");
                PermissionDecision::deny("Permission request timed out")
            }
        }
    }

    /// Resolve a pending request from a consumer `permission_response`
    /// unified message. Unknown ids (late answers) are ignored.
    pub async fn resolve(&self, response: &UnifiedMessage) -> bool {
        let Some(request_id) = response.meta_str("request_id") else {
            return false;
        };
        let behavior = match response.meta_str("behavior") {
            Some("allow") => PermissionBehavior::Allow,
            _ => PermissionBehavior::Deny,
        };
        let decision = PermissionDecision {
            behavior,
            updated_input: response.metadata.get("updated_input").cloned(),
            message: response.meta_str("message").map(str::to_owned),
        };
        self.resolve_id(request_id, decision).await
    }

    /// Resolve a pending request by id.
    pub async fn resolve_id(&self, request_id: &str, decision: PermissionDecision) -> bool {
        let waiter = self.waiters.lock().await.remove(request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(decision);
                true
            }
            None => false,
        }
    }

    /// Deny every pending request (session close path).
    pub async fn cancel_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock().await);
        for (_, tx) in waiters {
            let _ = tx.send(PermissionDecision::deny("Session closed"));
        }
    }

    /// Number of unresolved requests.
    pub async fn pending_count(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

#[cfg(test)]
#[path = "permission_tests.rs"]
mod tests;
