// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process adapter family.
//!
//! No subprocess and no socket: the backend is an [`AgentQuery`] driven
//! directly on the runtime. User messages feed a prompt queue the query
//! consumes; the query emits unified messages back and may ask for tool
//! permissions through the bridge, which suspends it until a consumer
//! answers or the timeout denies.
//!
//! The [`echo_query`] fixture doubles as the mock backend for end-to-end
//! tests across the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions};
use crate::error::{Error, Result};
use crate::message::{Role, UnifiedMessage, UnifiedType};
use crate::permission::{PermissionBridge, PermissionDecision, ToolRequestContext};

/// Everything a query needs to converse with the gateway.
pub struct QueryContext {
    session_id: String,
    prompts: mpsc::Receiver<UnifiedMessage>,
    emit_tx: mpsc::Sender<UnifiedMessage>,
    permissions: Arc<PermissionBridge>,
    abort: CancellationToken,
}

impl QueryContext {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next queued user prompt; `None` once the session closes.
    pub async fn next_prompt(&mut self) -> Option<UnifiedMessage> {
        self.prompts.recv().await
    }

    /// Push a message into the session's outbound stream.
    pub async fn emit(&self, msg: UnifiedMessage) -> bool {
        self.emit_tx.send(msg).await.is_ok()
    }

    /// Ask the consumers whether a tool may run. Suspends until answered,
    /// denied by timeout, or denied by session close.
    pub async fn can_use_tool(&self, tool_name: &str, input: Value) -> PermissionDecision {
        self.permissions
            .handle_tool_request(
                tool_name,
                input,
                ToolRequestContext { agent_id: Some(self.session_id.clone()), ..Default::default() },
            )
            .await
    }

    /// Turn-abort signal (fires on `interrupt` and on close). Long-running
    /// tool work should select against it; the prompt loop itself keeps
    /// serving turns after an interrupt.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }
}

/// An in-process agent implementation.
#[async_trait]
pub trait AgentQuery: Send + Sync {
    async fn run(&self, ctx: QueryContext);
}

/// In-process adapter: wraps one [`AgentQuery`] as a backend family.
pub struct InprocAdapter {
    name: String,
    query: Arc<dyn AgentQuery>,
}

impl InprocAdapter {
    pub fn new(name: impl Into<String>, query: Arc<dyn AgentQuery>) -> Self {
        Self { name: name.into(), query }
    }
}

#[async_trait]
impl BackendAdapter for InprocAdapter {
    fn name(&self) -> &str {
        &self.name
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

    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        let backend_session_id = options
            .resume
            .clone()
            .unwrap_or_else(|| format!("inproc-{}", uuid::Uuid::new_v4()));

        let (prompt_tx, prompt_rx) = mpsc::channel(64);
        let (emit_tx, mut emit_rx) = mpsc::channel::<UnifiedMessage>(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let abort = CancellationToken::new();
        let closed = CancellationToken::new();
        let permissions = Arc::new(PermissionBridge::new(emit_tx.clone()));

        // First message of every connection is the session snapshot.
        let init = UnifiedMessage::new(UnifiedType::SessionInit, Role::System)
            .with_meta("backend_session_id", json!(backend_session_id))
            .with_meta("adapter", json!(self.name.clone()))
            .with_meta("resumed", json!(options.resume.is_some()));
        let _ = emit_tx.send(init).await;

        let ctx = QueryContext {
            session_id: options.session_id.clone(),
            prompts: prompt_rx,
            emit_tx: emit_tx.clone(),
            permissions: Arc::clone(&permissions),
            abort: abort.clone(),
        };
        let query = Arc::clone(&self.query);
        let query_done = closed.clone();
        tokio::spawn(async move {
            query.run(ctx).await;
            // Query returned: the in-process "transport" is gone.
            query_done.cancel();
        });

        // Pump with echo suppression: the SDK family mirrors the consumer's
        // own user message back; those must not reach consumers twice, so
        // the translator drops them here.
        let pump_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_closed.cancelled() => break,
                    msg = emit_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if msg.kind == UnifiedType::UserMessage {
                            continue;
                        }
                        if out_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Drain whatever the query emitted before it finished.
            while let Ok(msg) = emit_rx.try_recv() {
                if msg.kind == UnifiedType::UserMessage {
                    continue;
                }
                if out_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(InprocSession {
            session_id: options.session_id,
            prompt_tx: Mutex::new(Some(prompt_tx)),
            messages: parking_lot::Mutex::new(Some(out_rx)),
            permissions,
            abort,
            closed,
            closed_flag: AtomicBool::new(false),
        }))
    }
}

struct InprocSession {
    session_id: String,
    prompt_tx: Mutex<Option<mpsc::Sender<UnifiedMessage>>>,
    messages: parking_lot::Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    permissions: Arc<PermissionBridge>,
    abort: CancellationToken,
    closed: CancellationToken,
    closed_flag: AtomicBool,
}

#[async_trait]
impl BackendSession for InprocSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, message: UnifiedMessage) -> Result<()> {
        if self.closed_flag.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        match message.kind {
            UnifiedType::UserMessage => {
                let tx = self.prompt_tx.lock().await.clone();
                match tx {
                    Some(tx) => tx
                        .send(message)
                        .await
                        .map_err(|_| Error::SessionClosed),
                    None => Err(Error::SessionClosed),
                }
            }
            UnifiedType::Interrupt => {
                self.abort.cancel();
                Ok(())
            }
            UnifiedType::PermissionResponse => {
                self.permissions.resolve(&message).await;
                Ok(())
            }
            // Configuration changes have no in-process counterpart.
            UnifiedType::ConfigurationChange => Ok(()),
            _ => Ok(()),
        }
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<UnifiedMessage>> {
        self.messages.lock().take()
    }

    async fn close(&self) {
        if self.closed_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        self.abort.cancel();
        self.permissions.cancel_all().await;
        *self.prompt_tx.lock().await = None;
        self.closed.cancel();
    }
}

// -- Built-in queries ---------------------------------------------------------

/// Echo fixture: mirrors each prompt as `echo: <text>`, completes the turn
/// with a result, and exercises the permission path for prompts of the form
/// `run: <command>`.
struct EchoQuery;

#[async_trait]
impl AgentQuery for EchoQuery {
    async fn run(&self, mut ctx: QueryContext) {
        while let Some(prompt) = ctx.next_prompt().await {
            let text = prompt.text();

            // SDK-style echo of the user's own message; the adapter pump
            // suppresses it before consumers see it.
            let echo = UnifiedMessage::new(UnifiedType::UserMessage, Role::User).with_text(&text);
            if !ctx.emit(echo).await {
                return;
            }

            if let Some(command) = text.strip_prefix("run:") {
                let command = command.trim().to_owned();
                let decision =
                    ctx.can_use_tool("Bash", json!({ "command": command.clone() })).await;
                let denied = decision.behavior == crate::permission::PermissionBehavior::Deny;
                let summary = UnifiedMessage::new(UnifiedType::ToolUseSummary, Role::Tool)
                    .with_meta("tool_name", json!("Bash"))
                    .with_meta("command", json!(command))
                    .with_meta("denied", json!(denied));
                if !ctx.emit(summary).await {
                    return;
                }
                let result = UnifiedMessage::new(UnifiedType::Result, Role::System)
                    .with_meta("is_error", json!(denied))
                    .with_meta(
                        "stop_reason",
                        if denied { Value::Null } else { json!("end_turn") },
                    );
                if !ctx.emit(result).await {
                    return;
                }
                continue;
            }

            let assistant = UnifiedMessage::new(UnifiedType::Assistant, Role::Assistant)
                .with_text(format!("echo: {text}"))
                .with_meta("done", json!(true));
            if !ctx.emit(assistant).await {
                return;
            }
            let result = UnifiedMessage::new(UnifiedType::Result, Role::System)
                .with_meta("is_error", json!(false))
                .with_meta("stop_reason", json!("end_turn"));
            if !ctx.emit(result).await {
                return;
            }
        }
    }
}

pub fn echo_query() -> Arc<dyn AgentQuery> {
    Arc::new(EchoQuery)
}

/// Test-scripted query: emissions are injected through the handle and every
/// received prompt is forwarded back out for assertions.
pub struct ScriptHandle {
    pub emissions: mpsc::Sender<UnifiedMessage>,
    pub prompts: Mutex<mpsc::Receiver<UnifiedMessage>>,
}

struct ScriptedQuery {
    script_rx: Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    prompt_fwd: mpsc::Sender<UnifiedMessage>,
}

#[async_trait]
impl AgentQuery for ScriptedQuery {
    async fn run(&self, mut ctx: QueryContext) {
        let Some(mut script_rx) = self.script_rx.lock().await.take() else {
            return;
        };
        loop {
            tokio::select! {
                scripted = script_rx.recv() => {
                    let Some(msg) = scripted else { break };
                    if !ctx.emit(msg).await {
                        break;
                    }
                }
                prompt = ctx.next_prompt() => {
                    let Some(prompt) = prompt else { break };
                    let _ = self.prompt_fwd.send(prompt).await;
                }
            }
        }
    }
}

/// Build a scripted query and its control handle. One session per adapter
/// instance; a second connect would find the script already taken.
pub fn scripted_query() -> (Arc<dyn AgentQuery>, ScriptHandle) {
    let (emissions_tx, emissions_rx) = mpsc::channel(64);
    let (prompt_fwd_tx, prompt_fwd_rx) = mpsc::channel(64);
    let query = ScriptedQuery {
        script_rx: Mutex::new(Some(emissions_rx)),
        prompt_fwd: prompt_fwd_tx,
    };
    let handle =
        ScriptHandle { emissions: emissions_tx, prompts: Mutex::new(prompt_fwd_rx) };
    (Arc::new(query), handle)
}

#[cfg(test)]
#[path = "inproc_tests.rs"]
mod tests;
