// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opencode family: HTTP requests out, one shared SSE stream back.
//!
//! One server process serves every session; the adapter keeps a single
//! `/event` subscription and demuxes server-sent events to per-session
//! subscribers by the `sessionID` carried in event properties. Outbound
//! operations are plain POSTs, all scoped to the configured directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions};
use crate::codec::SseParser;
use crate::error::{Error, Result};
use crate::message::{Role, UnifiedMessage, UnifiedType};

/// Reconnect attempts before the event stream is declared lost.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base of the exponential reconnect backoff (`base · 2^(attempt-1)`).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Shared transport state: HTTP client plus the one SSE subscription all
/// sessions of this adapter share.
struct EventHub {
    base_url: String,
    directory: String,
    basic_auth: Option<(String, String)>,
    client: reqwest::Client,
    subscribers: Mutex<HashMap<String, mpsc::Sender<UnifiedMessage>>>,
    sse_started: Mutex<bool>,
    shutdown: CancellationToken,
    max_retries: u32,
    backoff_base: Duration,
}

impl EventHub {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Directory scoping (query + header, percent-encoded by reqwest) and
    /// optional Basic auth, applied to every request.
    fn apply_scope(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req
            .query(&[("directory", self.directory.as_str())])
            .header("X-Opencode-Directory", &self.directory);
        match &self.basic_auth {
            Some((user, password)) => req.basic_auth(user, Some(password)),
            None => req,
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let req = self.client.post(self.url(path)).json(body);
        let resp = self
            .apply_scope(req)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("POST {path} failed: {e}")))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| Error::Connection(format!("POST {path}: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Connection(format!("POST {path} body: {e}")))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Start the shared SSE pump on first use.
    async fn ensure_started(self: &Arc<Self>) {
        let mut started = self.sse_started.lock().await;
        if *started {
            return;
        }
        *started = true;
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.run_sse_loop().await;
        });
    }

    /// One long-lived `/event` subscription with exponential backoff.
    ///
    /// A connection that comes up resets the retry ladder; after
    /// `max_retries` consecutive failures every session learns the stream
    /// is lost and the pump stops.
    async fn run_sse_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.connect_sse().await {
                Ok(()) => {
                    attempt = 1;
                }
                Err(e) => {
                    attempt += 1;
                    debug!(attempt, err = %e, "event stream connect failed");
                }
            }
            if attempt > self.max_retries {
                warn!("event stream lost after {} attempts", self.max_retries);
                self.fail_all_sessions("event stream lost").await;
                return;
            }
            let backoff = self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Hold one SSE connection until it drops. `Ok` means it came up and
    /// later ended; `Err` means it never came up.
    async fn connect_sse(&self) -> Result<()> {
        let req = self.client.get(self.url("/event"));
        let resp = self
            .apply_scope(req)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("GET /event failed: {e}")))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| Error::Connection(format!("GET /event: {e}")))?;

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { return Ok(()) };
            let Ok(bytes) = chunk else { return Ok(()) };
            for event in parser.feed(&bytes) {
                self.route_event(&event.data).await;
            }
        }
    }

    /// Demux one server-sent event to its session's subscriber.
    async fn route_event(&self, data: &str) {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            warn!("skipping unparseable sse event");
            return;
        };
        let kind = event.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        let properties = event.get("properties").cloned().unwrap_or(Value::Null);
        let session_key = properties
            .get("sessionID")
            .or_else(|| properties.pointer("/info/sessionID"))
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        let Some(msg) = translate_event(kind, &properties) else {
            return;
        };
        let subscribers = self.subscribers.lock().await;
        match session_key {
            Some(key) => {
                if let Some(tx) = subscribers.get(&key) {
                    let _ = tx.send(msg).await;
                }
            }
            None => {
                // Events without a session id go to everyone.
                for tx in subscribers.values() {
                    let _ = tx.send(msg.clone()).await;
                }
            }
        }
    }

    /// Tell every session the shared stream is gone, then drop them.
    async fn fail_all_sessions(&self, reason: &str) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock().await);
        for tx in subscribers.values() {
            let msg = UnifiedMessage::new(UnifiedType::Result, Role::System)
                .with_meta("is_error", json!(true))
                .with_meta("errors", json!([reason]))
                .with_meta("stop_reason", Value::Null);
            let _ = tx.send(msg).await;
        }
        // Senders drop here; every session stream ends.
    }
}

/// Adapter for an opencode-style HTTP + SSE server.
pub struct OpencodeAdapter {
    hub: Arc<EventHub>,
}

impl OpencodeAdapter {
    pub fn new(base_url: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            hub: Arc::new(EventHub {
                base_url: base_url.into().trim_end_matches('/').to_owned(),
                directory: directory.into(),
                basic_auth: None,
                client: reqwest::Client::new(),
                subscribers: Mutex::new(HashMap::new()),
                sse_started: Mutex::new(false),
                shutdown: CancellationToken::new(),
                max_retries: DEFAULT_MAX_RETRIES,
                backoff_base: DEFAULT_BACKOFF_BASE,
            }),
        }
    }

    // Builder methods run before the adapter is shared, so `get_mut`
    // always succeeds; a shared adapter silently keeps its old settings.

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        if let Some(hub) = Arc::get_mut(&mut self.hub) {
            hub.basic_auth = Some((user.into(), password.into()));
        }
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        if let Some(hub) = Arc::get_mut(&mut self.hub) {
            hub.max_retries = retries;
        }
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        if let Some(hub) = Arc::get_mut(&mut self.hub) {
            hub.backoff_base = base;
        }
        self
    }
}

#[async_trait]
impl BackendAdapter for OpencodeAdapter {
    fn name(&self) -> &str {
        "opencode"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            availability: Availability::Both,
            teams: false,
        }
    }

    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        self.hub.ensure_started().await;

        let backend_session_id = match &options.resume {
            Some(prior) => prior.clone(),
            None => {
                let created = self.hub.post_json("/session", &json!({})).await?;
                created
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .ok_or_else(|| Error::Protocol("server returned no session id".to_owned()))?
            }
        };

        let (tx, rx) = mpsc::channel(256);
        let init = UnifiedMessage::new(UnifiedType::SessionInit, Role::System)
            .with_meta("backend_session_id", json!(backend_session_id))
            .with_meta("resumed", json!(options.resume.is_some()))
            .with_meta("directory", json!(self.hub.directory.clone()));
        let _ = tx.send(init).await;
        self.hub.subscribers.lock().await.insert(backend_session_id.clone(), tx);

        Ok(Arc::new(OpencodeSession {
            session_id: options.session_id,
            backend_session_id,
            hub: Arc::clone(&self.hub),
            messages: parking_lot::Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }))
    }

    async fn stop(&self) {
        self.hub.shutdown.cancel();
        self.hub.subscribers.lock().await.clear();
    }
}

/// Translate one opencode event into a unified message; `None` suppresses.
pub fn translate_event(kind: &str, properties: &Value) -> Option<UnifiedMessage> {
    let msg = match kind {
        "message.part.updated" => {
            let part_type = properties.pointer("/part/type").and_then(|v| v.as_str());
            if part_type != Some("text") {
                return None;
            }
            let delta = properties
                .get("delta")
                .or_else(|| properties.pointer("/part/text"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            UnifiedMessage::new(UnifiedType::StreamEvent, Role::Assistant)
                .with_text(delta)
                .with_meta("event_kind", json!("part_updated"))
        }
        "session.status" => {
            let status = properties
                .get("status")
                .and_then(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .or_else(|| v.get("type").and_then(|t| t.as_str()).map(str::to_owned))
                })
                .unwrap_or_else(|| "running".to_owned());
            UnifiedMessage::new(UnifiedType::StatusChange, Role::System)
                .with_meta("status", json!(status))
        }
        "session.idle" => UnifiedMessage::new(UnifiedType::StatusChange, Role::System)
            .with_meta("status", json!("idle")),
        "permission.updated" => {
            let request_id = properties.get("id").and_then(|v| v.as_str())?;
            UnifiedMessage::new(UnifiedType::PermissionRequest, Role::System)
                .with_meta("request_id", json!(request_id))
                .with_meta(
                    "tool_name",
                    properties
                        .get("title")
                        .or_else(|| properties.pointer("/metadata/tool"))
                        .cloned()
                        .unwrap_or(json!("tool")),
                )
                .with_meta("input", properties.get("metadata").cloned().unwrap_or(Value::Null))
        }
        "session.error" => UnifiedMessage::new(UnifiedType::Result, Role::System)
            .with_meta("is_error", json!(true))
            .with_meta(
                "errors",
                json!([properties
                    .pointer("/error/data/message")
                    .or_else(|| properties.pointer("/error/message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("session error")]),
            )
            .with_meta("stop_reason", Value::Null),
        _ => return None,
    };
    Some(msg)
}

/// One opencode conversation.
pub struct OpencodeSession {
    session_id: String,
    backend_session_id: String,
    hub: Arc<EventHub>,
    messages: parking_lot::Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendSession for OpencodeSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, message: UnifiedMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        match message.kind {
            UnifiedType::UserMessage => {
                let body = json!({
                    "parts": [{ "type": "text", "text": message.text() }],
                });
                self.hub
                    .post_json(&format!("/session/{}/prompt_async", self.backend_session_id), &body)
                    .await
                    .map(|_| ())
            }
            UnifiedType::Interrupt => self
                .hub
                .post_json(&format!("/session/{}/abort", self.backend_session_id), &json!({}))
                .await
                .map(|_| ()),
            UnifiedType::PermissionResponse => {
                let Some(request_id) = message.meta_str("request_id") else {
                    return Ok(());
                };
                let reply = match message.meta_str("behavior") {
                    Some("allow") => {
                        if message.metadata.get("updated_permissions").is_some() {
                            "always"
                        } else {
                            "once"
                        }
                    }
                    _ => "reject",
                };
                self.hub
                    .post_json(
                        &format!("/permission/{request_id}/reply"),
                        &json!({ "reply": reply }),
                    )
                    .await
                    .map(|_| ())
            }
            UnifiedType::ConfigurationChange => Ok(()),
            _ => Ok(()),
        }
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<UnifiedMessage>> {
        self.messages.lock().take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unregister; dropping the sender ends this session's stream while
        // the shared SSE pump keeps serving other sessions.
        self.hub.subscribers.lock().await.remove(&self.backend_session_id);
    }
}

#[cfg(test)]
#[path = "opencode_tests.rs"]
mod tests;
