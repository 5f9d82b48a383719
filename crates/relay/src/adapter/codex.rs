// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Codex family: JSON-RPC 2.0 over a WebSocket to a local app-server.
//!
//! The app-server is spawned by a launcher (or already running); the
//! adapter dials the URL from `adapter_options.url` or its configured
//! default, performs the `initialize`/`initialized` handshake, and maps
//! turn events to unified messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions};
use crate::codec::jsonrpc::{JsonRpcCodec, JsonRpcMessage};
use crate::error::{Error, Result};
use crate::message::{Role, UnifiedMessage, UnifiedType};
use crate::supervisor::{LaunchSpec, SpawnOptions};

/// `initialize`/`initialized` handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Adapter for agents fronted by a local JSON-RPC WebSocket app-server.
pub struct CodexAdapter {
    default_url: Option<String>,
    /// Command the session launcher runs to start the app-server. When
    /// set, the adapter is inverted: the launcher owns the process and
    /// the adapter only dials the configured URL.
    launch_command: Option<Vec<String>>,
    handshake_timeout: Duration,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self { default_url: None, launch_command: None, handshake_timeout: HANDSHAKE_TIMEOUT }
    }

    /// URL used when `connect` receives none in its adapter options.
    pub fn with_app_server_url(mut self, url: impl Into<String>) -> Self {
        self.default_url = Some(url.into());
        self
    }

    /// Let the session launcher spawn the app-server. Pairs with
    /// [`with_app_server_url`]: the spawned server must listen where the
    /// configured URL points.
    ///
    /// [`with_app_server_url`]: CodexAdapter::with_app_server_url
    pub fn with_app_server_launch(mut self, command: Vec<String>) -> Self {
        self.launch_command = Some(command);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            availability: Availability::Local,
            teams: false,
        }
    }

    fn inverted(&self) -> bool {
        self.launch_command.is_some()
    }

    fn launch_spec(&self, options: &ConnectOptions) -> Option<LaunchSpec> {
        let command = self.launch_command.as_ref()?;
        let program = command.first()?.clone();
        let mut spawn = SpawnOptions::new(program)
            .with_args(command[1..].to_vec())
            .with_source("codex-app-server");
        if let Some(cwd) = options.option_str("cwd") {
            spawn = spawn.with_cwd(cwd.into());
        }
        Some(LaunchSpec { options: spawn })
    }

    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        let url = options
            .option_str("url")
            .map(str::to_owned)
            .or_else(|| self.default_url.clone())
            .ok_or_else(|| Error::Connection("no app-server url configured".to_owned()))?;

        let (ws, _) =
            tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| Error::Connection(format!("connect to {url} timed out")))?
                .map_err(|e| Error::Connection(format!("connect to {url} failed: {e}")))?;
        let (sink, source) = ws.split();

        CodexSession::start(options, sink, source, self.handshake_timeout)
            .await
            .map(|s| s as Arc<dyn BackendSession>)
    }
}

/// One conversation over one WebSocket connection.
pub struct CodexSession {
    session_id: String,
    codec: JsonRpcCodec,
    sink: Mutex<WsSink>,
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcMessage>>>>,
    /// permission request id → app-server call id.
    call_ids: Arc<Mutex<HashMap<String, Value>>>,
    messages: parking_lot::Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    out_tx: parking_lot::Mutex<Option<mpsc::Sender<UnifiedMessage>>>,
    closed: AtomicBool,
}

impl CodexSession {
    /// Handshake and start the receive pump. Split out of `connect` so
    /// tests can hand in a socket to an in-process fake app-server.
    pub async fn start(
        options: ConnectOptions,
        sink: WsSink,
        source: WsSource,
        handshake_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (out_tx, out_rx) = mpsc::channel(256);
        let session = Arc::new(Self {
            session_id: options.session_id.clone(),
            codec: JsonRpcCodec::new(),
            sink: Mutex::new(sink),
            pending: Arc::new(Mutex::new(HashMap::new())),
            call_ids: Arc::new(Mutex::new(HashMap::new())),
            messages: parking_lot::Mutex::new(Some(out_rx)),
            out_tx: parking_lot::Mutex::new(Some(out_tx)),
            closed: AtomicBool::new(false),
        });

        session.spawn_reader(source);

        let handshake = async {
            let response = session
                .request(
                    "initialize",
                    json!({
                        "clientInfo": { "name": "relay", "title": "relay gateway" },
                        "resume": options.resume,
                    }),
                )
                .await?;
            session.notify("initialized", json!({})).await?;
            Ok::<Value, Error>(response.result.unwrap_or(Value::Null))
        };
        let init_result = match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(Error::Connection("Initialize handshake timed out".to_owned()));
            }
        };

        let backend_session_id = init_result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or_else(|| options.resume.clone())
            .unwrap_or_else(|| format!("codex-{}", uuid::Uuid::new_v4()));
        let init = UnifiedMessage::new(UnifiedType::SessionInit, Role::System)
            .with_meta("backend_session_id", json!(backend_session_id))
            .with_meta("resumed", json!(options.resume.is_some()))
            .with_meta("server_info", init_result.get("serverInfo").cloned().unwrap_or(Value::Null));
        session.emit_out(init).await;

        Ok(session)
    }

    fn spawn_reader(self: &Arc<Self>, mut source: WsSource) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                // Malformed frames are dropped, never fatal.
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    warn!(session_id = %session.session_id, "dropping malformed ws frame");
                    continue;
                };
                let Ok(msg) = serde_json::from_value::<JsonRpcMessage>(value) else {
                    warn!(session_id = %session.session_id, "dropping non-jsonrpc ws frame");
                    continue;
                };
                session.dispatch(msg).await;
            }
            // WS closed or errored: the stream ends here.
            session.pending.lock().await.clear();
            session.closed.store(true, Ordering::Release);
            *session.out_tx.lock() = None;
        });
    }

    async fn dispatch(self: &Arc<Self>, frame: JsonRpcMessage) {
        if frame.is_response() {
            if let Some(id) = frame.id_i64() {
                if let Some(waiter) = self.pending.lock().await.remove(&id) {
                    let _ = waiter.send(frame);
                }
            }
            return;
        }
        let method = frame.method.clone().unwrap_or_default();
        let params = frame.params.unwrap_or(Value::Null);
        match method.as_str() {
            "response.output_text.delta" => {
                let delta = params.get("delta").and_then(|v| v.as_str()).unwrap_or_default();
                let msg = UnifiedMessage::new(UnifiedType::StreamEvent, Role::Assistant)
                    .with_text(delta)
                    .with_meta("event_kind", json!("output_text_delta"));
                self.emit_out(msg).await;
            }
            "response.output_item.done" => {
                let text = params
                    .pointer("/item/text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let msg = UnifiedMessage::new(UnifiedType::Assistant, Role::Assistant)
                    .with_text(text)
                    .with_meta("done", json!(true))
                    .with_meta("item", params.get("item").cloned().unwrap_or(Value::Null));
                self.emit_out(msg).await;
            }
            "response.completed" => {
                let msg = UnifiedMessage::new(UnifiedType::Result, Role::System)
                    .with_meta("is_error", json!(false))
                    .with_meta("usage", params.get("usage").cloned().unwrap_or(Value::Null))
                    .with_meta("stop_reason", json!("end_turn"));
                self.emit_out(msg).await;
            }
            "approval_requested" => {
                let request_id = uuid::Uuid::new_v4().to_string();
                let call_id = params.get("call_id").cloned().unwrap_or(Value::Null);
                self.call_ids.lock().await.insert(request_id.clone(), call_id.clone());
                let msg = UnifiedMessage::new(UnifiedType::PermissionRequest, Role::System)
                    .with_meta("request_id", json!(request_id))
                    .with_meta("call_id", call_id)
                    .with_meta("tool_name", params.get("tool").cloned().unwrap_or(json!("tool")))
                    .with_meta("input", params.get("input").cloned().unwrap_or(Value::Null));
                self.emit_out(msg).await;
            }
            "error" => {
                let msg = UnifiedMessage::new(UnifiedType::Result, Role::System)
                    .with_meta("is_error", json!(true))
                    .with_meta(
                        "errors",
                        json!([params.get("message").and_then(|v| v.as_str()).unwrap_or("backend error")]),
                    )
                    .with_meta("stop_reason", Value::Null);
                self.emit_out(msg).await;
            }
            other => {
                debug!(session_id = %self.session_id, method = other, "ignoring app-server frame");
            }
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<JsonRpcMessage> {
        let (id, frame) = self.codec.create_request(method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.write_frame(&frame).await?;
        let response = rx
            .await
            .map_err(|_| Error::Connection("app-server went away mid-request".to_owned()))?;
        if let Some(err) = &response.error {
            return Err(Error::Protocol(format!("{method}: {} ({})", err.message, err.code)));
        }
        Ok(response)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = self.codec.create_notification(method, params);
        self.write_frame(&frame).await
    }

    /// Fire a request whose response only acknowledges. An error reply is
    /// logged and swallowed; the turn's real outcome arrives as
    /// notifications.
    async fn send_request_logged(&self, method: &'static str, params: Value) -> Result<()> {
        let (id, frame) = self.codec.create_request(method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.write_frame(&frame).await?;

        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let Ok(response) = rx.await else { return };
            if let Some(err) = &response.error {
                warn!(
                    session_id,
                    method,
                    code = err.code,
                    error = %err.message,
                    "app-server rejected request"
                );
            }
        });
        Ok(())
    }

    async fn write_frame(&self, frame: &JsonRpcMessage) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| Error::Connection(format!("ws send failed: {e}")))
    }

    fn out_sender(&self) -> Option<mpsc::Sender<UnifiedMessage>> {
        self.out_tx.lock().clone()
    }

    async fn emit_out(&self, msg: UnifiedMessage) {
        if let Some(tx) = self.out_sender() {
            let _ = tx.send(msg).await;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BackendSession for CodexSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, message: UnifiedMessage) -> Result<()> {
        self.ensure_open()?;
        match message.kind {
            UnifiedType::UserMessage => {
                self.send_request_logged(
                    "turn.create",
                    json!({ "items": [{ "type": "text", "text": message.text() }] }),
                )
                .await
            }
            UnifiedType::Interrupt => self.notify("turn.cancel", json!({})).await,
            UnifiedType::PermissionResponse => {
                let Some(request_id) = message.meta_str("request_id") else {
                    return Ok(());
                };
                let Some(call_id) = self.call_ids.lock().await.remove(request_id) else {
                    return Ok(());
                };
                let approve = message.meta_str("behavior") == Some("allow");
                self.send_request_logged(
                    "approval.respond",
                    json!({ "call_id": call_id, "approve": approve }),
                )
                .await
            }
            UnifiedType::ConfigurationChange => {
                let mut params = serde_json::Map::new();
                if let Some(model) = message.meta_str("model") {
                    params.insert("model".to_owned(), json!(model));
                }
                if let Some(mode) = message.meta_str("mode") {
                    params.insert("approval_policy".to_owned(), json!(mode));
                }
                if params.is_empty() {
                    return Ok(());
                }
                self.notify("session.configure", Value::Object(params)).await
            }
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
        let _ = self.sink.lock().await.send(WsMessage::Close(None)).await;
        self.pending.lock().await.clear();
        self.call_ids.lock().await.clear();
        *self.out_tx.lock() = None;
    }
}

#[cfg(test)]
#[path = "codex_tests.rs"]
mod tests;
