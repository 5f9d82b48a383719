// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slash command dispatch.
//!
//! An ordered chain of handlers; the first whose `handles` accepts the
//! context executes. Order is fixed: local built-ins, adapter-native,
//! passthrough, then the terminal unsupported handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{BackendSession, SlashExecutor};
use crate::broadcast::Broadcaster;
use crate::error::{Error, Result};
use crate::events::{DomainEvent, EventBus};
use crate::message::{now_epoch_ms, Role, UnifiedMessage, UnifiedType};
use crate::protocol::ConsumerMessage;
use crate::session::{PendingPassthrough, SessionState};
use crate::trace;

/// Per-dispatch context stamped by the runtime.
#[derive(Debug, Clone)]
pub struct SlashContext {
    /// Full command text, e.g. `/help` or `/compact now`.
    pub command: String,
    /// Consumer-supplied correlation id, echoed back in results.
    pub request_id: Option<String>,
    /// Gateway-generated id for this dispatch.
    pub slash_request_id: String,
    pub trace_id: String,
    pub started_at_ms: u64,
}

impl SlashContext {
    pub fn new(command: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            command: command.into(),
            request_id,
            slash_request_id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace::trace_id(),
            started_at_ms: now_epoch_ms(),
        }
    }

    /// Command word without arguments: `/compact now` → `/compact`.
    pub fn base_command(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or(&self.command)
    }
}

/// Everything a handler may touch during one dispatch.
pub struct SlashInvocation<'a> {
    pub state: &'a mut SessionState,
    pub backend: Option<&'a Arc<dyn BackendSession>>,
    pub executor: Option<&'a Arc<dyn SlashExecutor>>,
    pub bus: &'a EventBus,
}

#[async_trait]
pub trait SlashHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, ctx: &SlashContext, inv: &SlashInvocation<'_>) -> bool;

    async fn execute(&self, ctx: &SlashContext, inv: &mut SlashInvocation<'_>) -> Result<()>;
}

/// The ordered chain.
pub struct SlashChain {
    handlers: Vec<Box<dyn SlashHandler>>,
}

impl SlashChain {
    /// `[Local, AdapterNative, Passthrough, Unsupported]`.
    pub fn standard() -> Self {
        Self {
            handlers: vec![
                Box::new(LocalHandler),
                Box::new(AdapterNativeHandler),
                Box::new(PassthroughHandler),
                Box::new(UnsupportedHandler),
            ],
        }
    }

    /// Dispatch to the first accepting handler. Handler failures surface
    /// as a `slash_command_error` frame plus a bus event; they never
    /// propagate out of the chain.
    pub async fn dispatch(&self, ctx: &SlashContext, inv: &mut SlashInvocation<'_>) {
        for handler in &self.handlers {
            if !handler.handles(ctx, inv) {
                continue;
            }
            if let Err(e) = handler.execute(ctx, inv).await {
                Broadcaster::broadcast(
                    inv.state,
                    &ConsumerMessage::SlashCommandError { error: e.to_string() },
                )
                .await;
                inv.bus.emit(DomainEvent::SlashFailed {
                    session_id: inv.state.session_id.clone(),
                    command: ctx.command.clone(),
                    error: e.to_string(),
                });
            }
            return;
        }
    }
}

/// Built-in commands answered without touching the backend.
pub struct LocalHandler;

const LOCAL_COMMANDS: &[&str] = &["/help", "/status"];

#[async_trait]
impl SlashHandler for LocalHandler {
    fn name(&self) -> &'static str {
        "local"
    }

    fn handles(&self, ctx: &SlashContext, _inv: &SlashInvocation<'_>) -> bool {
        LOCAL_COMMANDS.contains(&ctx.base_command())
    }

    async fn execute(&self, ctx: &SlashContext, inv: &mut SlashInvocation<'_>) -> Result<()> {
        let content = match ctx.base_command() {
            "/help" => {
                "Available commands: /help, /status. Other commands run on the agent when it supports them."
                    .to_owned()
            }
            "/status" => {
                let state = &*inv.state;
                format!(
                    "session {} · lifecycle {} · status {} · {} consumer(s)",
                    state.session_id,
                    state.lifecycle,
                    state.last_status.map_or("unknown", |s| s.as_str()),
                    state.consumer_count(),
                )
            }
            other => return Err(Error::Protocol(format!("no local handler for {other}"))),
        };
        Broadcaster::broadcast(
            inv.state,
            &ConsumerMessage::SlashCommandResult {
                command: ctx.command.clone(),
                request_id: ctx.request_id.clone(),
                source: "emulated".to_owned(),
                content,
            },
        )
        .await;
        inv.bus.emit(DomainEvent::SlashExecuted {
            session_id: inv.state.session_id.clone(),
            command: ctx.command.clone(),
            source: "emulated".to_owned(),
        });
        Ok(())
    }
}

/// Commands the adapter executes natively.
pub struct AdapterNativeHandler;

#[async_trait]
impl SlashHandler for AdapterNativeHandler {
    fn name(&self) -> &'static str {
        "adapter_native"
    }

    fn handles(&self, ctx: &SlashContext, inv: &SlashInvocation<'_>) -> bool {
        inv.executor.is_some_and(|e| e.handles(ctx.base_command()))
    }

    async fn execute(&self, ctx: &SlashContext, inv: &mut SlashInvocation<'_>) -> Result<()> {
        let executor = inv
            .executor
            .ok_or_else(|| Error::Protocol("native executor vanished mid-dispatch".to_owned()))?;
        let content = executor.execute(&inv.state.session_id, &ctx.command).await?;
        Broadcaster::broadcast(
            inv.state,
            &ConsumerMessage::SlashCommandResult {
                command: ctx.command.clone(),
                request_id: ctx.request_id.clone(),
                source: "native".to_owned(),
                content,
            },
        )
        .await;
        inv.bus.emit(DomainEvent::SlashExecuted {
            session_id: inv.state.session_id.clone(),
            command: ctx.command.clone(),
            source: "native".to_owned(),
        });
        Ok(())
    }
}

/// Forward the command to the backend as a user message; the backend's next
/// `result` is correlated back as the command's output.
pub struct PassthroughHandler;

#[async_trait]
impl SlashHandler for PassthroughHandler {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn handles(&self, _ctx: &SlashContext, inv: &SlashInvocation<'_>) -> bool {
        inv.state.slash_passthrough
    }

    async fn execute(&self, ctx: &SlashContext, inv: &mut SlashInvocation<'_>) -> Result<()> {
        let backend = inv
            .backend
            .ok_or_else(|| Error::Connection("backend not connected".to_owned()))?;
        inv.state.pending_passthroughs.push_back(PendingPassthrough {
            command: ctx.command.clone(),
            request_id: ctx.request_id.clone(),
            slash_request_id: ctx.slash_request_id.clone(),
            trace_id: ctx.trace_id.clone(),
        });
        let msg = UnifiedMessage::new(UnifiedType::UserMessage, Role::User)
            .with_text(&ctx.command)
            .with_meta("slash_request_id", json!(ctx.slash_request_id))
            .with_meta("trace_id", json!(ctx.trace_id));
        if let Err(e) = backend.send(msg).await {
            // Roll the entry back so a later result doesn't mis-correlate.
            inv.state.pending_passthroughs.pop_back();
            return Err(e);
        }
        Ok(())
    }
}

/// Terminal handler: always accepts, always reports unsupported.
pub struct UnsupportedHandler;

#[async_trait]
impl SlashHandler for UnsupportedHandler {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn handles(&self, _ctx: &SlashContext, _inv: &SlashInvocation<'_>) -> bool {
        true
    }

    async fn execute(&self, ctx: &SlashContext, inv: &mut SlashInvocation<'_>) -> Result<()> {
        Broadcaster::broadcast(
            inv.state,
            &ConsumerMessage::SlashCommandError {
                error: format!("{} is not supported by this agent", ctx.command),
            },
        )
        .await;
        inv.bus.emit(DomainEvent::SlashFailed {
            session_id: inv.state.session_id.clone(),
            command: ctx.command.clone(),
            error: "not supported".to_owned(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[path = "slash_tests.rs"]
mod tests;
