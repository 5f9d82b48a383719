// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session state: lifecycle machine, consumer roster, queued message,
//! pending correlation tables, and the replay history ring.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::broadcast::ConsumerSink;
use crate::message::{now_epoch_ms, MessageSequencer};
use crate::protocol::{ImagePayload, PresenceEntry};
use crate::rate::TokenBucket;

pub mod runtime;

pub use runtime::SessionRuntime;

/// Default bound on the replay history ring.
pub const DEFAULT_HISTORY_CAP: usize = 500;

/// Coarse session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Active,
    Idle,
    Degraded,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether `self → to` is a legal transition.
    ///
    /// ```text
    /// created → active
    /// active ↔ idle
    /// active → degraded → active
    /// any (non-closed) → closing → closed
    /// ```
    pub fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        if *self == to {
            return false;
        }
        match (self, to) {
            (Created, Active) => true,
            (Active, Idle) | (Idle, Active) => true,
            (Active, Degraded) | (Degraded, Active) => true,
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-reported activity status. Drives the queue-vs-send decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Running,
    Idle,
    Compacting,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Compacting => "compacting",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "idle" => Self::Idle,
            "compacting" => Self::Compacting,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerRole {
    Participant,
    Observer,
}

impl ConsumerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Observer => "observer",
        }
    }
}

/// Who is on the other end of a consumer socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: ConsumerRole,
}

/// One registered consumer socket.
pub struct ConsumerEntry {
    pub sink: Arc<dyn ConsumerSink>,
    pub identity: ConsumerIdentity,
    pub bucket: TokenBucket,
}

/// The single message a consumer may park while the backend is busy.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub content: String,
    pub images: Option<Vec<ImagePayload>>,
    /// Socket that queued it; only this socket may update or cancel.
    pub author_socket: u64,
    pub author: String,
}

/// In-flight permission prompt as the session tracks it.
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
    pub timestamp: u64,
    pub expires_at: u64,
}

/// A slash command forwarded to the backend as a user message, awaiting its
/// next `result` for correlation.
#[derive(Debug, Clone)]
pub struct PendingPassthrough {
    pub command: String,
    pub request_id: Option<String>,
    pub slash_request_id: String,
    pub trace_id: String,
}

/// Bounded ring of consumer-shaped frames replayed to joining consumers.
///
/// Oldest frames fall off when the cap is hit; sequence numbers keep
/// climbing so replay stays a prefix of what live consumers saw.
#[derive(Debug)]
pub struct HistoryRing {
    cap: usize,
    frames: VecDeque<Value>,
}

impl HistoryRing {
    pub fn new(cap: usize) -> Self {
        Self { cap, frames: VecDeque::new() }
    }

    pub fn push(&mut self, frame: Value) {
        self.frames.push_back(frame);
        while self.frames.len() > self.cap {
            self.frames.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Everything one session owns. Mutated only under the runtime's lock.
pub struct SessionState {
    pub session_id: String,
    /// Open map of declared keys: cwd, model, git_branch, slash_commands,
    /// adapterName, and whatever a `session_init` capability snapshot adds.
    pub state: Map<String, Value>,
    pub adapter_name: Option<String>,
    pub backend_session_id: Option<String>,
    pub lifecycle: LifecycleState,
    pub last_status: Option<BackendStatus>,
    pub queued: Option<QueuedMessage>,
    pub pending_permissions: HashMap<String, PendingPermission>,
    pub pending_passthroughs: VecDeque<PendingPassthrough>,
    pub history: HistoryRing,
    pub consumers: HashMap<u64, ConsumerEntry>,
    pub sequencer: MessageSequencer,
    pub anon_idx: u32,
    pub name: Option<String>,
    /// First user message text, held until the first successful result
    /// names the session from it.
    pub name_candidate: Option<String>,
    pub first_turn_done: bool,
    /// Whether the bound adapter accepts arbitrary slash commands as user
    /// messages (passthrough).
    pub slash_passthrough: bool,
    pub created_at: u64,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_history_cap(session_id, DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(session_id: impl Into<String>, cap: usize) -> Self {
        Self {
            session_id: session_id.into(),
            state: Map::new(),
            adapter_name: None,
            backend_session_id: None,
            lifecycle: LifecycleState::Created,
            last_status: None,
            queued: None,
            pending_permissions: HashMap::new(),
            pending_passthroughs: VecDeque::new(),
            history: HistoryRing::new(cap),
            consumers: HashMap::new(),
            sequencer: MessageSequencer::new(),
            anon_idx: 0,
            name: None,
            name_candidate: None,
            first_turn_done: false,
            slash_passthrough: false,
            created_at: now_epoch_ms(),
        }
    }

    /// Apply a lifecycle transition, or report the illegal pair.
    pub fn transition(
        &mut self,
        to: LifecycleState,
    ) -> std::result::Result<(), (LifecycleState, LifecycleState)> {
        if self.lifecycle.can_transition(to) {
            self.lifecycle = to;
            Ok(())
        } else {
            Err((self.lifecycle, to))
        }
    }

    /// State snapshot sent in `session_init` frames.
    pub fn snapshot(&self) -> Value {
        let mut snap = self.state.clone();
        snap.insert("session_id".to_owned(), json!(self.session_id));
        snap.insert("lifecycle".to_owned(), json!(self.lifecycle.as_str()));
        if let Some(adapter) = &self.adapter_name {
            snap.insert("adapterName".to_owned(), json!(adapter));
        }
        if let Some(backend_id) = &self.backend_session_id {
            snap.insert("backend_session_id".to_owned(), json!(backend_id));
        }
        if let Some(status) = self.last_status {
            snap.insert("status".to_owned(), json!(status.as_str()));
        }
        if let Some(name) = &self.name {
            snap.insert("name".to_owned(), json!(name));
        }
        Value::Object(snap)
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .consumers
            .values()
            .map(|c| PresenceEntry {
                user_id: c.identity.user_id.clone(),
                display_name: c.identity.display_name.clone(),
                role: c.identity.role.as_str().to_owned(),
            })
            .collect();
        entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        entries
    }

    /// Display name for the next unauthenticated consumer.
    pub fn next_anon_name(&mut self) -> String {
        self.anon_idx += 1;
        format!("guest-{}", self.anon_idx)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

#[cfg(test)]
#[path = "../session_tests.rs"]
mod tests;
