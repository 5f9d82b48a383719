// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain event bus.
//!
//! Lifecycle signals flow through one broadcast hub; watchdogs, the
//! coordinator, and tests subscribe. Sends never block and drop when no
//! subscriber is listening.

use tokio::sync::broadcast;

use crate::message::UnifiedMessage;

/// Every event family the bridge and coordinator emit.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    BackendConnected { session_id: String },
    BackendDisconnected { session_id: String },
    BackendSessionId { session_id: String, backend_session_id: String },
    BackendRelaunchNeeded { session_id: String },
    BackendMessage { session_id: String, message: Box<UnifiedMessage> },

    ConsumerConnected { session_id: String, user_id: String },
    ConsumerDisconnected { session_id: String, user_id: String },
    ConsumerAuthenticated { session_id: String, user_id: String },
    ConsumerAuthFailed { session_id: String },

    MessageInbound { session_id: String, kind: String },
    MessageOutbound { session_id: String, kind: String },

    PermissionRequested { session_id: String, request_id: String },
    PermissionResolved { session_id: String, request_id: String, behavior: String },

    FirstTurnCompleted { session_id: String },
    SessionClosed { session_id: String },

    SlashExecuted { session_id: String, command: String, source: String },
    SlashFailed { session_id: String, command: String, error: String },

    AuthStatus { session_id: String, status: serde_json::Value },
    CapabilitiesReady { session_id: String },
    CapabilitiesTimeout { session_id: String },

    Error { source: String, error: String, session_id: Option<String> },
}

impl DomainEvent {
    /// Session this event concerns, when it concerns exactly one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::BackendConnected { session_id }
            | Self::BackendDisconnected { session_id }
            | Self::BackendSessionId { session_id, .. }
            | Self::BackendRelaunchNeeded { session_id }
            | Self::BackendMessage { session_id, .. }
            | Self::ConsumerConnected { session_id, .. }
            | Self::ConsumerDisconnected { session_id, .. }
            | Self::ConsumerAuthenticated { session_id, .. }
            | Self::ConsumerAuthFailed { session_id }
            | Self::MessageInbound { session_id, .. }
            | Self::MessageOutbound { session_id, .. }
            | Self::PermissionRequested { session_id, .. }
            | Self::PermissionResolved { session_id, .. }
            | Self::FirstTurnCompleted { session_id }
            | Self::SessionClosed { session_id }
            | Self::SlashExecuted { session_id, .. }
            | Self::SlashFailed { session_id, .. }
            | Self::AuthStatus { session_id, .. }
            | Self::CapabilitiesReady { session_id }
            | Self::CapabilitiesTimeout { session_id } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
        }
    }
}

/// Broadcast hub for [`DomainEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn emit(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
