// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session map and transport-facing entry points.
//!
//! The bridge owns every [`SessionRuntime`] and is the only component that
//! mutates the map. Consumer sockets enter here; backend connections are
//! established here; everything session-interior happens in the runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::adapter::{AdapterResolver, ConnectOptions};
use crate::broadcast::ConsumerSink;
use crate::error::{close, Error, Result};
use crate::events::{DomainEvent, EventBus};
use crate::protocol::{ConsumerMessage, InboundMessage};
use crate::rate::TokenBucket;
use crate::session::{
    ConsumerEntry, ConsumerIdentity, ConsumerRole, SessionRuntime, DEFAULT_HISTORY_CAP,
};

/// Inbound consumer frame size cap (bytes).
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Bridge-level tunables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_frame_bytes: usize,
    pub history_cap: usize,
    /// Token-bucket burst size per socket.
    pub rate_capacity: u32,
    /// Token-bucket refill rate per socket.
    pub rate_refill_per_sec: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
            history_cap: DEFAULT_HISTORY_CAP,
            rate_capacity: 30,
            rate_refill_per_sec: 3.0,
        }
    }
}

/// Outcome of authenticating one consumer connection.
#[derive(Debug, Clone, Default)]
pub struct AuthVerdict {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<ConsumerRole>,
}

/// Injected authentication policy for consumer sockets.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, session_id: &str, token: Option<&str>) -> Result<AuthVerdict>;
}

/// Accepts everyone as an anonymous participant.
pub struct OpenAccess;

#[async_trait]
impl Authenticator for OpenAccess {
    async fn authenticate(&self, _session_id: &str, _token: Option<&str>) -> Result<AuthVerdict> {
        Ok(AuthVerdict::default())
    }
}

/// Requires an exact shared-token match.
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, _session_id: &str, token: Option<&str>) -> Result<AuthVerdict> {
        match token {
            Some(provided) if provided == self.token => Ok(AuthVerdict {
                user_id: Some("token-user".to_owned()),
                display_name: None,
                role: Some(ConsumerRole::Participant),
            }),
            _ => Err(Error::Auth("invalid or missing token".to_owned())),
        }
    }
}

/// Initial state for a freshly created or restored session.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub adapter_name: Option<String>,
    pub backend_session_id: Option<String>,
    pub name: Option<String>,
}

/// Owns the session map; routes consumer and backend traffic.
pub struct SessionBridge {
    sessions: RwLock<HashMap<String, Arc<SessionRuntime>>>,
    resolver: Arc<AdapterResolver>,
    authenticator: Arc<dyn Authenticator>,
    bus: EventBus,
    config: BridgeConfig,
    next_socket_id: AtomicU64,
}

impl SessionBridge {
    pub fn new(
        resolver: Arc<AdapterResolver>,
        authenticator: Arc<dyn Authenticator>,
        bus: EventBus,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            resolver,
            authenticator,
            bus,
            config,
            next_socket_id: AtomicU64::new(1),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // -- Session map -----------------------------------------------------------

    /// Register a new session runtime seeded with initial state.
    pub async fn create_session(&self, session_id: &str, seed: SessionSeed) -> Arc<SessionRuntime> {
        let runtime = SessionRuntime::new(session_id, self.bus.clone(), self.config.history_cap);
        runtime
            .with_state(|state| {
                if let Some(cwd) = &seed.cwd {
                    state.state.insert("cwd".to_owned(), json!(cwd));
                }
                if let Some(model) = &seed.model {
                    state.state.insert("model".to_owned(), json!(model));
                }
                if let Some(adapter) = &seed.adapter_name {
                    state.adapter_name = Some(adapter.clone());
                    state.state.insert("adapterName".to_owned(), json!(adapter));
                }
                state.backend_session_id = seed.backend_session_id.clone();
                state.name = seed.name.clone();
            })
            .await;
        self.sessions.write().await.insert(session_id.to_owned(), Arc::clone(&runtime));
        runtime
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions currently marked idle with no consumers (reaper input).
    pub async fn idle_candidates(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::new();
        for (id, runtime) in sessions.iter() {
            let idle = runtime
                .with_state(|s| {
                    s.last_status == Some(crate::session::BackendStatus::Idle)
                        && s.consumer_count() == 0
                })
                .await;
            if idle {
                out.push(id.clone());
            }
        }
        out
    }

    // -- Backend side ----------------------------------------------------------

    /// Resolve the session's adapter and connect its backend.
    ///
    /// `backend:connected` is emitted (by the attach) before any
    /// `backend:session_id` can arrive from the new stream.
    pub async fn connect_backend(
        &self,
        session_id: &str,
        adapter_options: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let runtime = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::Connection(format!("unknown session {session_id}")))?;
        let (adapter_name, resume) = runtime
            .with_state(|s| (s.adapter_name.clone(), s.backend_session_id.clone()))
            .await;
        let adapter_name =
            adapter_name.ok_or_else(|| Error::NoAdapter("session has no adapter bound".to_owned()))?;
        let adapter = self.resolver.resolve(&adapter_name)?;

        let options = ConnectOptions {
            session_id: session_id.to_owned(),
            resume,
            adapter_options,
        };
        let backend = adapter.connect(options).await?;
        let capabilities = adapter.capabilities();
        runtime
            .attach_backend(backend, adapter.slash_executor(), capabilities.slash_commands)
            .await;
        info!(session_id, adapter = adapter_name, "backend connected");
        Ok(())
    }

    // -- Consumer side ---------------------------------------------------------

    /// A consumer socket opened for `session_id`.
    ///
    /// On success returns the socket id used for subsequent frames; on
    /// failure the sink has been closed with the appropriate code.
    pub async fn handle_consumer_open(
        &self,
        session_id: &str,
        sink: Arc<dyn ConsumerSink>,
        token: Option<&str>,
    ) -> Option<u64> {
        let Some(runtime) = self.get(session_id).await else {
            sink.close(close::NOT_FOUND, "Session not found".to_owned()).await;
            return None;
        };

        let verdict = match self.authenticator.authenticate(session_id, token).await {
            Ok(verdict) => verdict,
            Err(e) => {
                debug!(session_id, err = %e, "consumer auth failed");
                self.bus.emit(DomainEvent::ConsumerAuthFailed {
                    session_id: session_id.to_owned(),
                });
                sink.close(close::AUTH_FAILED, "Authentication failed".to_owned()).await;
                return None;
            }
        };

        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let bucket =
            TokenBucket::new(self.config.rate_capacity, self.config.rate_refill_per_sec);

        let identity = runtime
            .with_state(|state| {
                let display_name = verdict
                    .display_name
                    .clone()
                    .unwrap_or_else(|| state.next_anon_name());
                let identity = ConsumerIdentity {
                    user_id: verdict
                        .user_id
                        .clone()
                        .unwrap_or_else(|| format!("anon-{socket_id}")),
                    display_name,
                    role: verdict.role.unwrap_or(ConsumerRole::Participant),
                };
                state.consumers.insert(
                    socket_id,
                    ConsumerEntry { sink: Arc::clone(&sink), identity: identity.clone(), bucket },
                );
                identity
            })
            .await;

        self.bus.emit(DomainEvent::ConsumerAuthenticated {
            session_id: session_id.to_owned(),
            user_id: identity.user_id.clone(),
        });
        self.bus.emit(DomainEvent::ConsumerConnected {
            session_id: session_id.to_owned(),
            user_id: identity.user_id.clone(),
        });

        // Welcome sequence: identity, state snapshot, replay, presence.
        runtime
            .send_to(
                socket_id,
                &ConsumerMessage::Identity {
                    user_id: identity.user_id.clone(),
                    display_name: identity.display_name.clone(),
                    role: identity.role.as_str().to_owned(),
                },
            )
            .await;
        let (snapshot, messages) =
            runtime.with_state(|state| (state.snapshot(), state.history.snapshot())).await;
        runtime.send_to(socket_id, &ConsumerMessage::SessionInit { session: snapshot }).await;
        runtime.send_to(socket_id, &ConsumerMessage::MessageHistory { messages }).await;
        runtime.broadcast_presence().await;

        if !runtime.backend_attached().await {
            self.bus.emit(DomainEvent::BackendRelaunchNeeded {
                session_id: session_id.to_owned(),
            });
        }
        Some(socket_id)
    }

    /// One raw text frame from a consumer socket.
    pub async fn handle_consumer_message(&self, session_id: &str, socket_id: u64, raw: &str) {
        let Some(runtime) = self.get(session_id).await else {
            return;
        };

        if raw.len() > self.config.max_frame_bytes {
            // Oversized frames close the socket; no runtime mutation.
            let sink = runtime
                .with_state(|state| state.consumers.remove(&socket_id).map(|e| e.sink))
                .await;
            if let Some(sink) = sink {
                sink.close(close::TOO_BIG, "Message Too Big".to_owned()).await;
            }
            self.bus.emit(DomainEvent::Error {
                source: "bridge".to_owned(),
                error: format!("oversized frame ({} bytes)", raw.len()),
                session_id: Some(session_id.to_owned()),
            });
            return;
        }

        let allowed = runtime
            .with_state(|state| {
                state.consumers.get(&socket_id).map(|entry| entry.bucket.try_acquire())
            })
            .await;
        match allowed {
            Some(true) => {}
            Some(false) => {
                runtime
                    .send_to(socket_id, &ConsumerMessage::Error {
                        message: "rate limit exceeded".to_owned(),
                    })
                    .await;
                return;
            }
            // Unknown socket: frames after close are dropped.
            None => return,
        }

        let parsed: std::result::Result<InboundMessage, _> = serde_json::from_str(raw);
        match parsed {
            Ok(msg) => runtime.handle_inbound(socket_id, msg).await,
            Err(e) => {
                runtime
                    .send_to(socket_id, &ConsumerMessage::Error {
                        message: format!("invalid message: {e}"),
                    })
                    .await;
            }
        }
    }

    /// A consumer socket closed.
    pub async fn handle_consumer_close(&self, session_id: &str, socket_id: u64) {
        let Some(runtime) = self.get(session_id).await else {
            return;
        };
        let user_id = runtime
            .with_state(|state| {
                state.consumers.remove(&socket_id).map(|entry| entry.identity.user_id)
            })
            .await;
        if let Some(user_id) = user_id {
            runtime.broadcast_presence().await;
            self.bus.emit(DomainEvent::ConsumerDisconnected {
                session_id: session_id.to_owned(),
                user_id,
            });
        }
    }

    /// Close every session (shutdown path).
    pub async fn close_all(&self) {
        let runtimes: Vec<Arc<SessionRuntime>> =
            self.sessions.write().await.drain().map(|(_, r)| r).collect();
        for runtime in runtimes {
            runtime.close().await;
        }
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
