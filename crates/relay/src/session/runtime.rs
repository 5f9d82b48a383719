// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session orchestrator.
//!
//! Inbound: consumer commands become unified messages for the backend, or
//! mutate session-local state (queue, permissions, adapter binding).
//! Outbound: backend unified messages are mapped to consumer frames,
//! broadcast, and applied as side effects (status, naming, correlation).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adapter::{BackendSession, SlashExecutor};
use crate::broadcast::Broadcaster;
use crate::events::{DomainEvent, EventBus};
use crate::message::{now_epoch_ms, Role, UnifiedContent, UnifiedMessage, UnifiedType};
use crate::protocol::{ConsumerMessage, ImagePayload, InboundMessage};
use crate::session::{
    BackendStatus, LifecycleState, PendingPermission, QueuedMessage, SessionState,
};
use crate::slash::{SlashChain, SlashContext, SlashInvocation};

/// Session name length cap applied to the first-turn candidate.
const NAME_CAP: usize = 48;

/// Watchdog verdicts applied back onto a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyCommand {
    ReconnectTimeout,
    IdleReap,
    CapabilitiesTimeout,
}

/// One session's live orchestrator. The bridge owns the map of these.
pub struct SessionRuntime {
    state: Mutex<SessionState>,
    backend: Mutex<Option<Arc<dyn BackendSession>>>,
    executor: parking_lot::Mutex<Option<Arc<dyn SlashExecutor>>>,
    slash: SlashChain,
    bus: EventBus,
    /// Serializes backend sends so outbound order matches inbound order.
    send_gate: Mutex<()>,
    /// Bumped on every attach; a stale pump ending late must not detach a
    /// newer backend.
    backend_gen: AtomicU64,
}

impl SessionRuntime {
    pub fn new(session_id: impl Into<String>, bus: EventBus, history_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::with_history_cap(session_id, history_cap)),
            backend: Mutex::new(None),
            executor: parking_lot::Mutex::new(None),
            slash: SlashChain::standard(),
            bus,
            send_gate: Mutex::new(()),
            backend_gen: AtomicU64::new(0),
        })
    }

    /// Run a closure against the locked session state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Broadcast a frame to every consumer of this session.
    pub async fn broadcast(&self, msg: &ConsumerMessage) -> u64 {
        let mut state = self.state.lock().await;
        Broadcaster::broadcast(&mut state, msg).await
    }

    /// Send a frame to one consumer socket.
    pub async fn send_to(&self, socket_id: u64, msg: &ConsumerMessage) -> u64 {
        let mut state = self.state.lock().await;
        Broadcaster::send_to(&mut state, socket_id, msg).await
    }

    /// Broadcast the current presence snapshot.
    pub async fn broadcast_presence(&self) {
        let mut state = self.state.lock().await;
        Broadcaster::broadcast_presence(&mut state).await;
    }

    pub async fn session_id(&self) -> String {
        self.state.lock().await.session_id.clone()
    }

    pub async fn backend_attached(&self) -> bool {
        self.backend.lock().await.is_some()
    }

    /// Bind a connected backend session and start its pump.
    ///
    /// Emits `backend:connected` before any `backend:session_id` can flow
    /// (the pump only starts after the lifecycle transition).
    pub async fn attach_backend(
        self: &Arc<Self>,
        backend: Arc<dyn BackendSession>,
        executor: Option<Arc<dyn SlashExecutor>>,
        slash_passthrough: bool,
    ) {
        let messages = backend.take_messages();
        let generation = self.backend_gen.fetch_add(1, Ordering::AcqRel) + 1;
        *self.backend.lock().await = Some(Arc::clone(&backend));
        *self.executor.lock() = executor;

        let session_id = {
            let mut state = self.state.lock().await;
            state.slash_passthrough = slash_passthrough;
            let target = LifecycleState::Active;
            if let Err((from, to)) = state.transition(target) {
                self.on_invalid_transition(&state.session_id, from, to);
            }
            Broadcaster::broadcast(&mut state, &ConsumerMessage::CliConnected {}).await;
            state.session_id.clone()
        };
        self.bus.emit(DomainEvent::BackendConnected { session_id: session_id.clone() });

        let Some(mut messages) = messages else {
            warn!(session_id, "backend message stream already consumed");
            return;
        };
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                runtime.handle_backend_message(msg).await;
            }
            runtime.on_backend_stream_end(generation).await;
        });
    }

    /// Backend stream ended: detach and degrade, unless a newer backend
    /// has already been attached.
    async fn on_backend_stream_end(&self, generation: u64) {
        if self.backend_gen.load(Ordering::Acquire) != generation {
            return;
        }
        *self.backend.lock().await = None;
        let session_id = {
            let mut state = self.state.lock().await;
            // Already closing or closed: this is the expected teardown.
            if !matches!(state.lifecycle, LifecycleState::Closing | LifecycleState::Closed) {
                if let Err((from, to)) = state.transition(LifecycleState::Degraded) {
                    self.on_invalid_transition(&state.session_id, from, to);
                }
            }
            Broadcaster::broadcast(&mut state, &ConsumerMessage::CliDisconnected {}).await;
            state.session_id.clone()
        };
        self.bus.emit(DomainEvent::BackendDisconnected { session_id });
    }

    fn on_invalid_transition(&self, session_id: &str, from: LifecycleState, to: LifecycleState) {
        warn!(session_id, %from, %to, "invalid lifecycle transition");
        self.bus.emit(DomainEvent::Error {
            source: "lifecycle".to_owned(),
            error: format!("invalid transition {from} -> {to}"),
            session_id: Some(session_id.to_owned()),
        });
    }

    // -- Inbound (consumer → backend) -----------------------------------------

    /// Handle one parsed consumer command from `socket_id`.
    pub async fn handle_inbound(self: &Arc<Self>, socket_id: u64, msg: InboundMessage) {
        let session_id = self.session_id().await;
        self.bus.emit(DomainEvent::MessageInbound {
            session_id,
            kind: msg.tag().to_owned(),
        });

        match msg {
            InboundMessage::UserMessage { content, images, .. } => {
                self.handle_user_message(socket_id, content, images, false).await;
            }
            InboundMessage::Interrupt {} => {
                let mut state = self.state.lock().await;
                Broadcaster::broadcast(&mut state, &ConsumerMessage::Interrupt {}).await;
                drop(state);
                let msg = UnifiedMessage::new(UnifiedType::Interrupt, Role::User);
                self.send_backend(socket_id, msg).await;
            }
            InboundMessage::PermissionResponse {
                request_id,
                behavior,
                updated_input,
                updated_permissions,
                message,
            } => {
                {
                    let mut state = self.state.lock().await;
                    state.pending_permissions.remove(&request_id);
                }
                let mut unified =
                    UnifiedMessage::new(UnifiedType::PermissionResponse, Role::User)
                        .with_meta("request_id", json!(request_id))
                        .with_meta("behavior", json!(behavior.as_str()));
                if let Some(updated_input) = updated_input {
                    unified = unified.with_meta("updated_input", updated_input);
                }
                if let Some(updated_permissions) = updated_permissions {
                    unified = unified.with_meta("updated_permissions", updated_permissions);
                }
                if let Some(message) = message {
                    unified = unified.with_meta("message", json!(message));
                }
                let behavior = behavior.as_str().to_owned();
                self.send_backend(socket_id, unified).await;
                let session_id = self.session_id().await;
                self.bus.emit(DomainEvent::PermissionResolved {
                    session_id,
                    request_id,
                    behavior,
                });
            }
            InboundMessage::SetModel { model } => {
                {
                    let mut state = self.state.lock().await;
                    state.state.insert("model".to_owned(), json!(model));
                }
                let unified = UnifiedMessage::new(UnifiedType::ConfigurationChange, Role::User)
                    .with_meta("model", json!(model));
                self.send_backend(socket_id, unified).await;
            }
            InboundMessage::SetPermissionMode { mode } => {
                {
                    let mut state = self.state.lock().await;
                    state.state.insert("permission_mode".to_owned(), json!(mode));
                }
                let unified = UnifiedMessage::new(UnifiedType::ConfigurationChange, Role::User)
                    .with_meta("mode", json!(mode));
                self.send_backend(socket_id, unified).await;
            }
            InboundMessage::SlashCommand { command, request_id } => {
                let ctx = SlashContext::new(command, request_id);
                let backend = self.backend.lock().await.clone();
                let executor = self.executor.lock().clone();
                let mut state = self.state.lock().await;
                let mut inv = SlashInvocation {
                    state: &mut state,
                    backend: backend.as_ref(),
                    executor: executor.as_ref(),
                    bus: &self.bus,
                };
                self.slash.dispatch(&ctx, &mut inv).await;
            }
            InboundMessage::QueueMessage { content, images } => {
                self.handle_queue_message(socket_id, content, images).await;
            }
            InboundMessage::UpdateQueuedMessage { content, images } => {
                let mut state = self.state.lock().await;
                match &mut state.queued {
                    Some(queued) if queued.author_socket == socket_id => {
                        queued.content = content.clone();
                        queued.images = images;
                        let author = queued.author.clone();
                        Broadcaster::broadcast(
                            &mut state,
                            &ConsumerMessage::QueuedMessageUpdated { content, author },
                        )
                        .await;
                    }
                    Some(_) => {
                        Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                            message: "only the author may update the queued message".to_owned(),
                        })
                        .await;
                    }
                    None => {
                        Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                            message: "no message is queued".to_owned(),
                        })
                        .await;
                    }
                }
            }
            InboundMessage::CancelQueuedMessage {} => {
                let mut state = self.state.lock().await;
                match &state.queued {
                    Some(queued) if queued.author_socket == socket_id => {
                        state.queued = None;
                        Broadcaster::broadcast(
                            &mut state,
                            &ConsumerMessage::QueuedMessageCancelled {},
                        )
                        .await;
                    }
                    Some(_) => {
                        Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                            message: "only the author may cancel the queued message".to_owned(),
                        })
                        .await;
                    }
                    None => {
                        Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                            message: "no message is queued".to_owned(),
                        })
                        .await;
                    }
                }
            }
            InboundMessage::PresenceQuery {} => {
                let mut state = self.state.lock().await;
                let msg = ConsumerMessage::PresenceUpdate {
                    consumers: state.presence(),
                    count: state.consumer_count(),
                };
                Broadcaster::send_to(&mut state, socket_id, &msg).await;
            }
            InboundMessage::SetAdapter { adapter } => {
                let mut state = self.state.lock().await;
                if state.lifecycle == LifecycleState::Created {
                    state.adapter_name = Some(adapter.clone());
                    state.state.insert("adapterName".to_owned(), json!(adapter));
                } else {
                    Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                        message: "adapter can only be set before the session is active".to_owned(),
                    })
                    .await;
                }
            }
        }
    }

    /// `queued=false`: direct user message. `queued=true`: auto-flush path.
    async fn handle_user_message(
        self: &Arc<Self>,
        socket_id: u64,
        content: String,
        images: Option<Vec<ImagePayload>>,
        from_queue: bool,
    ) {
        use base64::Engine;
        if let Some(images) = &images {
            let bad = images.iter().any(|image| {
                base64::engine::general_purpose::STANDARD.decode(&image.data).is_err()
            });
            if bad {
                let mut state = self.state.lock().await;
                Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                    message: "image data is not valid base64".to_owned(),
                })
                .await;
                return;
            }
        }
        {
            let mut state = self.state.lock().await;
            // Optimistic: the turn is running from the consumer's view.
            state.last_status = Some(BackendStatus::Running);
            if state.lifecycle == LifecycleState::Idle {
                let _ = state.transition(LifecycleState::Active);
            }
            if state.name.is_none() && state.name_candidate.is_none() {
                state.name_candidate = Some(truncate_name(&content));
            }
            let author = state
                .consumers
                .get(&socket_id)
                .map(|c| c.identity.display_name.clone());
            if from_queue {
                Broadcaster::broadcast(
                    &mut state,
                    &ConsumerMessage::QueuedMessageSent { content: content.clone() },
                )
                .await;
            }
            Broadcaster::broadcast(
                &mut state,
                &ConsumerMessage::UserMessage {
                    content: content.clone(),
                    images: images.clone(),
                    author,
                },
            )
            .await;
        }

        let mut unified =
            UnifiedMessage::new(UnifiedType::UserMessage, Role::User).with_text(&content);
        for image in images.unwrap_or_default() {
            unified = unified.with_content(UnifiedContent::Image {
                source: crate::message::ImageSource {
                    media_type: image.media_type,
                    data: image.data,
                },
            });
        }
        self.send_backend(socket_id, unified).await;
    }

    async fn handle_queue_message(
        self: &Arc<Self>,
        socket_id: u64,
        content: String,
        images: Option<Vec<ImagePayload>>,
    ) {
        let queue_now = {
            let state = self.state.lock().await;
            matches!(
                state.last_status,
                Some(BackendStatus::Running) | Some(BackendStatus::Compacting)
            )
        };
        if !queue_now {
            // Idle: send immediately, no message_queued frame.
            self.handle_user_message(socket_id, content, images, false).await;
            return;
        }
        let mut state = self.state.lock().await;
        if state.queued.is_some() {
            Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                message: "a message is already queued".to_owned(),
            })
            .await;
            return;
        }
        let author = state
            .consumers
            .get(&socket_id)
            .map(|c| c.identity.display_name.clone())
            .unwrap_or_else(|| "unknown".to_owned());
        state.queued = Some(QueuedMessage {
            content: content.clone(),
            images,
            author_socket: socket_id,
            author: author.clone(),
        });
        Broadcaster::broadcast(&mut state, &ConsumerMessage::MessageQueued { content, author })
            .await;
    }

    /// Send one unified message to the backend, serialized per session.
    /// Failures come back to the issuing consumer as an error frame.
    async fn send_backend(self: &Arc<Self>, socket_id: u64, msg: UnifiedMessage) {
        let backend = self.backend.lock().await.clone();
        let Some(backend) = backend else {
            let mut state = self.state.lock().await;
            Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                message: "backend not connected".to_owned(),
            })
            .await;
            let session_id = state.session_id.clone();
            drop(state);
            self.bus.emit(DomainEvent::BackendRelaunchNeeded { session_id });
            return;
        };
        let _gate = self.send_gate.lock().await;
        if let Err(e) = backend.send(msg).await {
            let mut state = self.state.lock().await;
            Broadcaster::send_to(&mut state, socket_id, &ConsumerMessage::Error {
                message: format!("backend send failed: {e}"),
            })
            .await;
            let session_id = state.session_id.clone();
            drop(state);
            self.bus.emit(DomainEvent::Error {
                source: "runtime".to_owned(),
                error: e.to_string(),
                session_id: Some(session_id),
            });
        }
    }

    // -- Outbound (backend → consumers) ---------------------------------------

    /// Route one backend unified message: observe, map, broadcast, effect.
    pub async fn handle_backend_message(self: &Arc<Self>, msg: UnifiedMessage) {
        let session_id = self.session_id().await;
        // Observer hook for metrics and tracing.
        self.bus.emit(DomainEvent::BackendMessage {
            session_id: session_id.clone(),
            message: Box::new(msg.clone()),
        });
        self.bus.emit(DomainEvent::MessageOutbound {
            session_id: session_id.clone(),
            kind: msg.kind.as_str().to_owned(),
        });

        // Flush decision and backend send happen after the state lock drops.
        let mut flush: Option<QueuedMessage> = None;

        {
            let mut state = self.state.lock().await;
            match msg.kind {
                UnifiedType::SessionInit => {
                    // Capability snapshot: fold backend-declared keys into
                    // the session state map.
                    for (key, value) in &msg.metadata {
                        if key == "backend_session_id" {
                            continue;
                        }
                        state.state.insert(key.clone(), value.clone());
                    }
                    if let Some(backend_id) = msg.meta_str("backend_session_id") {
                        state.backend_session_id = Some(backend_id.to_owned());
                        self.bus.emit(DomainEvent::BackendSessionId {
                            session_id: session_id.clone(),
                            backend_session_id: backend_id.to_owned(),
                        });
                    }
                    self.bus.emit(DomainEvent::CapabilitiesReady {
                        session_id: session_id.clone(),
                    });
                    let snapshot = state.snapshot();
                    Broadcaster::broadcast(
                        &mut state,
                        &ConsumerMessage::SessionInit { session: snapshot },
                    )
                    .await;
                }
                UnifiedType::StatusChange => {
                    let status = msg
                        .meta_str("status")
                        .and_then(BackendStatus::from_str_opt);
                    if let Some(status) = status {
                        state.last_status = Some(status);
                        match status {
                            BackendStatus::Idle => {
                                if state.lifecycle == LifecycleState::Active {
                                    let _ = state.transition(LifecycleState::Idle);
                                }
                                flush = state.queued.take();
                            }
                            BackendStatus::Running | BackendStatus::Compacting => {
                                if state.lifecycle == LifecycleState::Idle {
                                    let _ = state.transition(LifecycleState::Active);
                                }
                            }
                        }
                        Broadcaster::broadcast(
                            &mut state,
                            &ConsumerMessage::StatusChange { status: status.as_str().to_owned() },
                        )
                        .await;
                    }
                }
                UnifiedType::Assistant => {
                    let message = consumer_shape(&msg);
                    Broadcaster::broadcast(
                        &mut state,
                        &ConsumerMessage::Assistant {
                            message,
                            parent_tool_use_id: msg.parent_id.clone(),
                        },
                    )
                    .await;
                }
                UnifiedType::Result => {
                    let is_error = msg
                        .metadata
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let data = Value::Object(msg.metadata.clone());
                    Broadcaster::broadcast(&mut state, &ConsumerMessage::Result { data: data.clone() })
                        .await;

                    // Passthrough correlation: the next result answers the
                    // oldest outstanding passthrough command.
                    if let Some(pending) = state.pending_passthroughs.pop_front() {
                        Broadcaster::broadcast(
                            &mut state,
                            &ConsumerMessage::SlashCommandResult {
                                command: pending.command.clone(),
                                request_id: pending.request_id.clone(),
                                source: "passthrough".to_owned(),
                                content: data.to_string(),
                            },
                        )
                        .await;
                        self.bus.emit(DomainEvent::SlashExecuted {
                            session_id: session_id.clone(),
                            command: pending.command,
                            source: "passthrough".to_owned(),
                        });
                    }

                    // First successful turn names the session.
                    if !is_error && !state.first_turn_done {
                        state.first_turn_done = true;
                        if state.name.is_none() {
                            state.name = state.name_candidate.take();
                        }
                        self.bus.emit(DomainEvent::FirstTurnCompleted {
                            session_id: session_id.clone(),
                        });
                    }

                    // A queued message also flushes on turn completion.
                    if flush.is_none() {
                        flush = state.queued.take();
                    }
                }
                UnifiedType::StreamEvent => {
                    let event = consumer_shape(&msg);
                    Broadcaster::broadcast(
                        &mut state,
                        &ConsumerMessage::StreamEvent {
                            event,
                            parent_tool_use_id: msg.parent_id.clone(),
                        },
                    )
                    .await;
                }
                UnifiedType::PermissionRequest => {
                    if let Some(request_id) = msg.meta_str("request_id") {
                        state.pending_permissions.insert(
                            request_id.to_owned(),
                            PendingPermission {
                                tool_name: msg
                                    .meta_str("tool_name")
                                    .unwrap_or("tool")
                                    .to_owned(),
                                input: msg
                                    .metadata
                                    .get("input")
                                    .cloned()
                                    .unwrap_or(Value::Null),
                                tool_use_id: msg.meta_str("tool_use_id").map(str::to_owned),
                                timestamp: now_epoch_ms(),
                                expires_at: msg
                                    .metadata
                                    .get("expires_at")
                                    .and_then(Value::as_u64)
                                    .unwrap_or_else(|| now_epoch_ms() + 120_000),
                            },
                        );
                        self.bus.emit(DomainEvent::PermissionRequested {
                            session_id: session_id.clone(),
                            request_id: request_id.to_owned(),
                        });
                    }
                    Broadcaster::broadcast(
                        &mut state,
                        &ConsumerMessage::PermissionRequest {
                            request: Value::Object(msg.metadata.clone()),
                        },
                    )
                    .await;
                }
                UnifiedType::AuthStatus => {
                    let status = Value::Object(msg.metadata.clone());
                    self.bus.emit(DomainEvent::AuthStatus {
                        session_id: session_id.clone(),
                        status: status.clone(),
                    });
                    Broadcaster::broadcast(&mut state, &ConsumerMessage::AuthStatus { status })
                        .await;
                }
                UnifiedType::ToolProgress => {
                    Broadcaster::broadcast(
                        &mut state,
                        &ConsumerMessage::ToolProgress {
                            progress: Value::Object(msg.metadata.clone()),
                        },
                    )
                    .await;
                }
                UnifiedType::ToolUseSummary => {
                    Broadcaster::broadcast(
                        &mut state,
                        &ConsumerMessage::ToolUseSummary {
                            summary: Value::Object(msg.metadata.clone()),
                        },
                    )
                    .await;
                }
                UnifiedType::ConfigurationChange => {
                    // Backend-announced capability updates (slash command
                    // lists, mode changes) fold into session state.
                    for (key, value) in &msg.metadata {
                        state.state.insert(key.clone(), value.clone());
                    }
                }
                UnifiedType::ControlResponse
                | UnifiedType::UserMessage
                | UnifiedType::PermissionResponse
                | UnifiedType::Interrupt
                | UnifiedType::Unknown => {
                    debug!(session_id, kind = %msg.kind, "ignoring backend message");
                }
            }
        }

        if let Some(queued) = flush {
            self.handle_user_message(queued.author_socket, queued.content, queued.images, true)
                .await;
        }
    }

    // -- Policy ----------------------------------------------------------------

    /// Apply a watchdog verdict. Invalid transitions are reported through
    /// the invalid-transition hook, never thrown.
    pub async fn apply_policy_command(self: &Arc<Self>, cmd: PolicyCommand) {
        match cmd {
            PolicyCommand::ReconnectTimeout => {
                let mut state = self.state.lock().await;
                if let Err((from, to)) = state.transition(LifecycleState::Degraded) {
                    self.on_invalid_transition(&state.session_id.clone(), from, to);
                }
            }
            PolicyCommand::IdleReap => {
                self.close().await;
            }
            PolicyCommand::CapabilitiesTimeout => {
                let session_id = {
                    let mut state = self.state.lock().await;
                    Broadcaster::broadcast(&mut state, &ConsumerMessage::Error {
                        message: "backend capabilities not reported in time".to_owned(),
                    })
                    .await;
                    state.session_id.clone()
                };
                self.bus.emit(DomainEvent::CapabilitiesTimeout { session_id });
            }
        }
    }

    /// Close the session: backend, permissions, consumers, lifecycle.
    pub async fn close(self: &Arc<Self>) {
        let session_id = {
            let mut state = self.state.lock().await;
            if state.lifecycle == LifecycleState::Closed {
                return;
            }
            if state.lifecycle != LifecycleState::Closing {
                if let Err((from, to)) = state.transition(LifecycleState::Closing) {
                    self.on_invalid_transition(&state.session_id.clone(), from, to);
                }
            }
            state.session_id.clone()
        };

        let backend = self.backend.lock().await.take();
        if let Some(backend) = backend {
            backend.close().await;
        }

        let mut state = self.state.lock().await;
        state.pending_permissions.clear();
        state.pending_passthroughs.clear();
        state.queued = None;
        for entry in state.consumers.values() {
            entry.sink.close(crate::error::close::NORMAL, "session closed".to_owned()).await;
        }
        state.consumers.clear();
        let _ = state.transition(LifecycleState::Closed);
        drop(state);

        self.bus.emit(DomainEvent::SessionClosed { session_id });
    }
}

/// Consumer-facing shape of a backend message: the unified envelope as
/// plain JSON (stable field names, content blocks inline).
fn consumer_shape(msg: &UnifiedMessage) -> Value {
    serde_json::to_value(msg).unwrap_or_else(|e| {
        warn!(err = %e, "unserializable unified message");
        json!({ "id": msg.id, "type": msg.kind.as_str() })
    })
}

fn truncate_name(content: &str) -> String {
    let trimmed = content.trim();
    let mut name: String = trimmed.chars().take(NAME_CAP).collect();
    if trimmed.chars().count() > NAME_CAP {
        name.push('…');
    }
    name
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
