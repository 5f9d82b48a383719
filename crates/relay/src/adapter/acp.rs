// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ACP family: JSON-RPC 2.0 over child-process stdio, framed as NDJSON.
//!
//! Session state machine: connecting → initializing → ready → closed.
//! The initialize handshake (and `session/new` / `session/load`) happens
//! inside `connect`, so a returned session is always ready.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions};
use crate::codec::jsonrpc::{JsonRpcCodec, JsonRpcMessage, METHOD_NOT_FOUND};
use crate::codec::NdjsonParser;
use crate::error::{Error, Result};
use crate::message::{Role, UnifiedContent, UnifiedMessage, UnifiedType};
use crate::supervisor::signal_pid;

/// Initialize handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// SIGTERM grace before SIGKILL on close.
const KILL_GRACE: Duration = Duration::from_secs(5);

const STATE_CONNECTING: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Adapter for agents speaking ACP on stdio.
pub struct AcpAdapter {
    command: Vec<String>,
    handshake_timeout: Duration,
}

impl AcpAdapter {
    /// `command` is the agent program plus its fixed arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self { command, handshake_timeout: HANDSHAKE_TIMEOUT }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl BackendAdapter for AcpAdapter {
    fn name(&self) -> &str {
        "acp"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        let program = self
            .command
            .first()
            .ok_or_else(|| Error::Connection("acp adapter has no command configured".to_owned()))?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = options.option_str("cwd") {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|e| Error::Connection(format!("spawn {program} failed: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Connection(format!("{program} exited before pid read")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("child stdin unavailable".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("child stdout unavailable".to_owned()))?;

        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = exited_tx.send(true);
        });

        AcpSession::start(
            options,
            stdout,
            stdin,
            Some(ProcessHandle { pid, exited_rx }),
            self.handshake_timeout,
        )
        .await
        .map(|s| s as Arc<dyn BackendSession>)
    }
}

/// Kill handle for the spawned agent process.
pub struct ProcessHandle {
    pid: u32,
    exited_rx: watch::Receiver<bool>,
}

impl ProcessHandle {
    pub fn new(pid: u32, exited_rx: watch::Receiver<bool>) -> Self {
        Self { pid, exited_rx }
    }
}

/// One ACP conversation over a byte-stream pair.
pub struct AcpSession {
    session_id: String,
    backend_session_id: Mutex<Option<String>>,
    codec: JsonRpcCodec,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcMessage>>>>,
    /// permission request id → JSON-RPC id the agent is blocked on.
    permission_rpc_ids: Arc<Mutex<HashMap<String, Value>>>,
    messages: parking_lot::Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    /// Dropped on close so the message stream terminates.
    out_tx: parking_lot::Mutex<Option<mpsc::Sender<UnifiedMessage>>>,
    state: Arc<AtomicU8>,
    closed: CancellationToken,
    process: Mutex<Option<ProcessHandle>>,
}

impl AcpSession {
    /// Drive the handshake over arbitrary IO and return a ready session.
    ///
    /// Exposed so tests can speak the agent side over an in-memory duplex;
    /// production use always goes through [`AcpAdapter::connect`].
    pub async fn start<R, W>(
        options: ConnectOptions,
        reader: R,
        writer: W,
        process: Option<ProcessHandle>,
        handshake_timeout: Duration,
    ) -> Result<Arc<Self>>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(256);
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let session = Arc::new(Self {
            session_id: options.session_id.clone(),
            backend_session_id: Mutex::new(None),
            codec: JsonRpcCodec::new(),
            writer: Mutex::new(Box::new(writer)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            permission_rpc_ids: Arc::new(Mutex::new(HashMap::new())),
            messages: parking_lot::Mutex::new(Some(out_rx)),
            out_tx: parking_lot::Mutex::new(Some(out_tx)),
            state,
            closed: CancellationToken::new(),
            process: Mutex::new(process),
        });

        session.spawn_reader(reader);

        session.state.store(STATE_INITIALIZING, Ordering::Release);
        let init_result = match tokio::time::timeout(handshake_timeout, session.initialize(&options))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                session.close().await;
                return Err(Error::Connection("Initialize handshake timed out".to_owned()));
            }
        };
        match init_result {
            Ok(init_msg) => {
                session.state.store(STATE_READY, Ordering::Release);
                session.emit_out(init_msg).await;
                Ok(session)
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// initialize → session/new (or session/load on resume) → session_init.
    async fn initialize(&self, options: &ConnectOptions) -> Result<UnifiedMessage> {
        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientCapabilities": {
                        "fs": { "readTextFile": false, "writeTextFile": false },
                        "terminal": false,
                    },
                }),
            )
            .await?;
        let init_result = init.result.unwrap_or(Value::Null);

        let cwd = options.option_str("cwd").unwrap_or(".").to_owned();
        let (method, params) = match &options.resume {
            Some(prior) => {
                ("session/load", json!({ "sessionId": prior, "cwd": cwd, "mcpServers": [] }))
            }
            None => ("session/new", json!({ "cwd": cwd, "mcpServers": [] })),
        };
        let opened = self.request(method, params).await?;
        let backend_session_id = opened
            .result
            .as_ref()
            .and_then(|r| r.get("sessionId"))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or_else(|| options.resume.clone())
            .ok_or_else(|| Error::Protocol("agent returned no sessionId".to_owned()))?;
        *self.backend_session_id.lock().await = Some(backend_session_id.clone());

        let mut msg = UnifiedMessage::new(UnifiedType::SessionInit, Role::System)
            .with_meta("backend_session_id", json!(backend_session_id))
            .with_meta("resumed", json!(options.resume.is_some()));
        if let Some(version) = init_result.get("protocolVersion") {
            msg = msg.with_meta("protocol_version", version.clone());
        }
        if let Some(caps) = init_result.get("agentCapabilities") {
            msg = msg.with_meta("agent_capabilities", caps.clone());
        }
        if let Some(info) = init_result.get("agentInfo") {
            msg = msg.with_meta("agent_info", info.clone());
        }
        if let Some(auth) = init_result.get("authMethods") {
            msg = msg.with_meta("auth_methods", auth.clone());
        }
        Ok(msg)
    }

    fn spawn_reader<R>(self: &Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let session = Arc::clone(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut parser = NdjsonParser::new();
            let mut buf = vec![0u8; 8192];
            loop {
                let read = tokio::select! {
                    _ = closed.cancelled() => break,
                    read = reader.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for value in parser.feed(&buf[..n]) {
                    session.dispatch(value).await;
                }
            }
            // Transport gone: fail outstanding waiters and end the stream.
            session.pending.lock().await.clear();
            session.state.store(STATE_CLOSED, Ordering::Release);
            *session.out_tx.lock() = None;
            session.closed.cancel();
        });
    }

    /// Route one decoded frame. Malformed frames are logged and skipped;
    /// the pump never dies to a bad frame.
    async fn dispatch(self: &Arc<Self>, value: Value) {
        let frame: JsonRpcMessage = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                warn!(session_id = %self.session_id, err = %e, "skipping malformed acp frame");
                return;
            }
        };
        if frame.jsonrpc != "2.0" {
            warn!(session_id = %self.session_id, "skipping acp frame with bad version");
            return;
        }

        if frame.is_response() {
            if let Some(id) = frame.id_i64() {
                if let Some(waiter) = self.pending.lock().await.remove(&id) {
                    let _ = waiter.send(frame);
                }
            }
            return;
        }

        let method = frame.method.clone().unwrap_or_default();
        if frame.is_request() {
            let id = frame.id.clone().unwrap_or(Value::Null);
            match method.as_str() {
                "session/request_permission" => {
                    self.handle_permission_request(id, frame.params.unwrap_or(Value::Null)).await;
                }
                m if m.starts_with("fs/") || m.starts_with("terminal/") => {
                    let reply =
                        self.codec.create_error_response(id, METHOD_NOT_FOUND, "Method not supported");
                    let _ = self.write_frame(&reply).await;
                }
                _ => {
                    let reply =
                        self.codec.create_error_response(id, METHOD_NOT_FOUND, "Method not supported");
                    let _ = self.write_frame(&reply).await;
                }
            }
            return;
        }

        // Notifications.
        if method == "session/update" {
            if let Some(msg) = translate_session_update(&frame.params.unwrap_or(Value::Null)) {
                self.emit_out(msg).await;
            }
        } else {
            debug!(session_id = %self.session_id, method, "ignoring acp notification");
        }
    }

    async fn handle_permission_request(self: &Arc<Self>, rpc_id: Value, params: Value) {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.permission_rpc_ids.lock().await.insert(request_id.clone(), rpc_id);

        let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
        let tool_name = tool_call
            .get("title")
            .or_else(|| tool_call.get("kind"))
            .and_then(|v| v.as_str())
            .unwrap_or("tool")
            .to_owned();
        let mut msg = UnifiedMessage::new(UnifiedType::PermissionRequest, Role::System)
            .with_meta("request_id", json!(request_id))
            .with_meta("tool_name", json!(tool_name))
            .with_meta("input", tool_call.get("rawInput").cloned().unwrap_or(Value::Null));
        if let Some(tool_use_id) = tool_call.get("toolCallId") {
            msg = msg.with_meta("tool_use_id", tool_use_id.clone());
        }
        if let Some(options) = params.get("options") {
            msg = msg.with_meta("options", options.clone());
        }
        self.emit_out(msg).await;
    }

    fn out_sender(&self) -> Option<mpsc::Sender<UnifiedMessage>> {
        self.out_tx.lock().clone()
    }

    async fn emit_out(&self, msg: UnifiedMessage) {
        if let Some(tx) = self.out_sender() {
            let _ = tx.send(msg).await;
        }
    }

    /// Send a request and await its response through the pending table.
    async fn request(&self, method: &str, params: Value) -> Result<JsonRpcMessage> {
        let (id, frame) = self.codec.create_request(method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.write_frame(&frame).await?;
        let response = rx
            .await
            .map_err(|_| Error::Connection("agent went away mid-request".to_owned()))?;
        if let Some(err) = &response.error {
            return Err(Error::Protocol(format!("{method}: {} ({})", err.message, err.code)));
        }
        Ok(response)
    }

    async fn write_frame(&self, frame: &JsonRpcMessage) -> Result<()> {
        let line = self.codec.encode(frame)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Connection(format!("write to agent failed: {e}")))?;
        writer.flush().await.map_err(|e| Error::Connection(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Fire a configuration request without blocking the send path. An
    /// error reply (agents without the method answer −32601) is logged
    /// and swallowed; the turn must not fail over a settings tweak.
    async fn send_config_request(&self, method: &'static str, params: Value) -> Result<()> {
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
                    "agent rejected configuration change"
                );
            }
        });
        Ok(())
    }

    async fn backend_id(&self) -> String {
        self.backend_session_id.lock().await.clone().unwrap_or_default()
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => Err(Error::SessionClosed),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BackendSession for AcpSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, message: UnifiedMessage) -> Result<()> {
        self.ensure_ready()?;
        match message.kind {
            UnifiedType::UserMessage => {
                let backend_id = self.backend_id().await;
                let mut prompt: Vec<Value> = Vec::new();
                for block in &message.content {
                    match block {
                        UnifiedContent::Text { text } => {
                            prompt.push(json!({ "type": "text", "text": text }));
                        }
                        UnifiedContent::Image { source } => {
                            prompt.push(json!({
                                "type": "image",
                                "mimeType": source.media_type,
                                "data": source.data,
                            }));
                        }
                        _ => {}
                    }
                }
                let (id, frame) = self.codec.create_request(
                    "session/prompt",
                    json!({ "sessionId": backend_id, "prompt": prompt }),
                );
                let (tx, rx) = oneshot::channel();
                self.pending.lock().await.insert(id, tx);
                self.write_frame(&frame).await?;

                // The prompt response arrives at turn end with a stopReason;
                // surface it as the turn's result.
                let out_tx = self.out_sender();
                tokio::spawn(async move {
                    let Some(out_tx) = out_tx else { return };
                    let Ok(response) = rx.await else { return };
                    let result = match (&response.result, &response.error) {
                        (_, Some(err)) => UnifiedMessage::new(UnifiedType::Result, Role::System)
                            .with_meta("is_error", json!(true))
                            .with_meta("errors", json!([err.message]))
                            .with_meta("stop_reason", Value::Null),
                        (Some(res), None) => UnifiedMessage::new(UnifiedType::Result, Role::System)
                            .with_meta("is_error", json!(false))
                            .with_meta(
                                "stop_reason",
                                res.get("stopReason").cloned().unwrap_or(Value::Null),
                            ),
                        (None, None) => UnifiedMessage::new(UnifiedType::Result, Role::System)
                            .with_meta("is_error", json!(false))
                            .with_meta("stop_reason", Value::Null),
                    };
                    let _ = out_tx.send(result).await;
                });
                Ok(())
            }
            UnifiedType::Interrupt => {
                let backend_id = self.backend_id().await;
                let frame = self
                    .codec
                    .create_notification("session/cancel", json!({ "sessionId": backend_id }));
                self.write_frame(&frame).await
            }
            UnifiedType::PermissionResponse => {
                let Some(request_id) = message.meta_str("request_id") else {
                    return Ok(());
                };
                let Some(rpc_id) = self.permission_rpc_ids.lock().await.remove(request_id) else {
                    // Late answer; the prompt already resolved.
                    return Ok(());
                };
                let outcome = match message.meta_str("behavior") {
                    Some("allow") => {
                        let option_id = message
                            .meta_str("option_id")
                            .unwrap_or("allow")
                            .to_owned();
                        json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
                    }
                    _ => json!({ "outcome": { "outcome": "cancelled" } }),
                };
                let reply = self.codec.create_response(rpc_id, outcome);
                self.write_frame(&reply).await
            }
            UnifiedType::ConfigurationChange => {
                let backend_id = self.backend_id().await;
                if let Some(mode) = message.meta_str("mode") {
                    return self
                        .send_config_request(
                            "session/set_mode",
                            json!({ "sessionId": backend_id, "modeId": mode }),
                        )
                        .await;
                }
                if let Some(model) = message.meta_str("model") {
                    return self
                        .send_config_request(
                            "session/set_model",
                            json!({ "sessionId": backend_id, "modelId": model }),
                        )
                        .await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn send_raw(&self, line: &str) -> Result<()> {
        self.ensure_ready()?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| Error::Connection(format!("raw write failed: {e}")))?;
        writer.flush().await.map_err(|e| Error::Connection(format!("flush failed: {e}")))?;
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<UnifiedMessage>> {
        self.messages.lock().take()
    }

    async fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        self.closed.cancel();
        *self.out_tx.lock() = None;
        self.pending.lock().await.clear();
        self.permission_rpc_ids.lock().await.clear();

        if let Some(handle) = self.process.lock().await.take() {
            let ProcessHandle { pid, mut exited_rx } = handle;
            signal_pid(pid, Signal::SIGTERM);
            let wait_exit = async {
                while !*exited_rx.borrow() {
                    if exited_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            tokio::select! {
                _ = wait_exit => {}
                _ = tokio::time::sleep(KILL_GRACE) => {
                    signal_pid(pid, Signal::SIGKILL);
                }
            }
        }
    }
}

/// Translate one `session/update` notification into a unified message.
///
/// Returns `None` for updates with nothing to tell consumers.
pub fn translate_session_update(params: &Value) -> Option<UnifiedMessage> {
    let update = params.get("update")?;
    let kind = update.get("sessionUpdate").and_then(|v| v.as_str())?;

    let msg = match kind {
        "agent_message_chunk" => {
            let text = update
                .pointer("/content/text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            UnifiedMessage::new(UnifiedType::StreamEvent, Role::Assistant)
                .with_content(UnifiedContent::Text { text })
                .with_meta("event_kind", json!("message_delta"))
        }
        "agent_thought_chunk" => {
            let thinking = update
                .pointer("/content/text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            UnifiedMessage::new(UnifiedType::StreamEvent, Role::Assistant)
                .with_content(UnifiedContent::Thinking { thinking })
                .with_meta("event_kind", json!("thought_delta"))
        }
        "tool_call" => UnifiedMessage::new(UnifiedType::ToolProgress, Role::Tool)
            .with_meta("tool_use_id", update.get("toolCallId").cloned().unwrap_or(Value::Null))
            .with_meta("title", update.get("title").cloned().unwrap_or(Value::Null))
            .with_meta("status", update.get("status").cloned().unwrap_or(json!("pending"))),
        "tool_call_update" => {
            let status = update.get("status").and_then(|v| v.as_str()).unwrap_or("in_progress");
            let kind = if matches!(status, "completed" | "failed") {
                UnifiedType::ToolUseSummary
            } else {
                UnifiedType::ToolProgress
            };
            UnifiedMessage::new(kind, Role::Tool)
                .with_meta("tool_use_id", update.get("toolCallId").cloned().unwrap_or(Value::Null))
                .with_meta("status", json!(status))
                .with_meta("content", update.get("content").cloned().unwrap_or(Value::Null))
        }
        "plan" => UnifiedMessage::new(UnifiedType::StreamEvent, Role::Assistant)
            .with_meta("event_kind", json!("plan"))
            .with_meta("entries", update.get("entries").cloned().unwrap_or(Value::Null)),
        "available_commands_update" => {
            UnifiedMessage::new(UnifiedType::ConfigurationChange, Role::System)
                .with_meta(
                    "slash_commands",
                    update.get("availableCommands").cloned().unwrap_or(json!([])),
                )
        }
        "current_mode_update" => UnifiedMessage::new(UnifiedType::ConfigurationChange, Role::System)
            .with_meta("permission_mode", update.get("currentModeId").cloned().unwrap_or(Value::Null)),
        _ => UnifiedMessage::new(UnifiedType::Unknown, Role::System)
            .with_meta("raw", update.clone()),
    };
    Some(msg.with_meta("raw_update_kind", json!(kind)))
}

#[cfg(test)]
#[path = "acp_tests.rs"]
mod tests;
