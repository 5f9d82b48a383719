// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use async_trait::async_trait;

use super::*;
use crate::adapter::inproc::{scripted_query, InprocAdapter};
use crate::adapter::{BackendAdapter, ConnectOptions};
use crate::test_support::add_test_consumer;

struct CompactExecutor;

#[async_trait]
impl SlashExecutor for CompactExecutor {
    fn handles(&self, command: &str) -> bool {
        command == "/compact"
    }

    async fn execute(&self, _session_id: &str, command: &str) -> Result<String> {
        if command.contains("fail") {
            return Err(Error::Process("compaction failed".to_owned()));
        }
        Ok("compacted 12 messages".to_owned())
    }
}

fn make_state(name: &str) -> (SessionState, Arc<crate::test_support::TestSink>) {
    let mut state = SessionState::new(name);
    let (_, sink) = add_test_consumer(&mut state, "ana");
    (state, sink)
}

#[tokio::test]
async fn local_help_is_emulated() {
    let (mut state, sink) = make_state("s1");
    let bus = EventBus::new();
    let chain = SlashChain::standard();
    let ctx = SlashContext::new("/help", Some("r1".to_owned()));
    let mut inv = SlashInvocation { state: &mut state, backend: None, executor: None, bus: &bus };

    chain.dispatch(&ctx, &mut inv).await;

    let results = sink.frames_of("slash_command_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source"], "emulated");
    assert_eq!(results[0]["request_id"], "r1");
    assert!(results[0]["content"].as_str().is_some_and(|c| c.contains("/help")));
}

#[tokio::test]
async fn local_status_reports_session() {
    let (mut state, sink) = make_state("s-status");
    state.last_status = Some(crate::session::BackendStatus::Running);
    let bus = EventBus::new();
    let chain = SlashChain::standard();
    let ctx = SlashContext::new("/status", None);
    let mut inv = SlashInvocation { state: &mut state, backend: None, executor: None, bus: &bus };

    chain.dispatch(&ctx, &mut inv).await;

    let results = sink.frames_of("slash_command_result");
    assert!(results[0]["content"].as_str().is_some_and(|c| c.contains("s-status")));
    assert!(results[0]["content"].as_str().is_some_and(|c| c.contains("running")));
}

#[tokio::test]
async fn native_executor_wins_over_passthrough() {
    let (mut state, sink) = make_state("s1");
    state.slash_passthrough = true;
    let bus = EventBus::new();
    let chain = SlashChain::standard();
    let executor: Arc<dyn SlashExecutor> = Arc::new(CompactExecutor);
    let ctx = SlashContext::new("/compact", None);
    let mut inv = SlashInvocation {
        state: &mut state,
        backend: None,
        executor: Some(&executor),
        bus: &bus,
    };

    chain.dispatch(&ctx, &mut inv).await;

    let results = sink.frames_of("slash_command_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source"], "native");
    assert_eq!(results[0]["content"], "compacted 12 messages");
    assert!(state.pending_passthroughs.is_empty());
}

#[tokio::test]
async fn native_failure_becomes_error_frame() -> anyhow::Result<()> {
    let (mut state, sink) = make_state("s1");
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let chain = SlashChain::standard();
    let executor: Arc<dyn SlashExecutor> = Arc::new(CompactExecutor);
    let ctx = SlashContext::new("/compact fail", None);
    let mut inv = SlashInvocation {
        state: &mut state,
        backend: None,
        executor: Some(&executor),
        bus: &bus,
    };

    chain.dispatch(&ctx, &mut inv).await;

    let errors = sink.frames_of("slash_command_error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["error"].as_str().is_some_and(|e| e.contains("compaction failed")));
    match events.try_recv() {
        Ok(DomainEvent::SlashFailed { command, .. }) => {
            assert_eq!(command, "/compact fail");
            Ok(())
        }
        other => anyhow::bail!("expected SlashFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn passthrough_enqueues_and_sends_user_message() -> anyhow::Result<()> {
    let (mut state, sink) = make_state("s1");
    state.slash_passthrough = true;
    let bus = EventBus::new();
    let chain = SlashChain::standard();

    let (query, handle) = scripted_query();
    let adapter = InprocAdapter::new("scripted", query);
    let backend = adapter.connect(ConnectOptions::new("s1")).await?;

    let ctx = SlashContext::new("/custom arg", Some("r9".to_owned()));
    let mut inv = SlashInvocation {
        state: &mut state,
        backend: Some(&backend),
        executor: None,
        bus: &bus,
    };
    chain.dispatch(&ctx, &mut inv).await;

    assert_eq!(state.pending_passthroughs.len(), 1);
    let entry = &state.pending_passthroughs[0];
    assert_eq!(entry.command, "/custom arg");
    assert_eq!(entry.request_id.as_deref(), Some("r9"));

    let prompt = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        handle.prompts.lock().await.recv().await
    })
    .await?
    .ok_or_else(|| anyhow::anyhow!("prompt not forwarded"))?;
    assert_eq!(prompt.text(), "/custom arg");

    // No result frame yet; correlation happens on the backend's result.
    assert!(sink.frames_of("slash_command_result").is_empty());
    backend.close().await;
    Ok(())
}

#[tokio::test]
async fn unsupported_is_terminal() {
    let (mut state, sink) = make_state("s1");
    let bus = EventBus::new();
    let chain = SlashChain::standard();
    let ctx = SlashContext::new("/mystery", None);
    let mut inv = SlashInvocation { state: &mut state, backend: None, executor: None, bus: &bus };

    chain.dispatch(&ctx, &mut inv).await;

    let errors = sink.frames_of("slash_command_error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["error"].as_str().is_some_and(|e| e.contains("not supported")));
}

#[test]
fn base_command_strips_arguments() {
    let ctx = SlashContext::new("/compact now please", None);
    assert_eq!(ctx.base_command(), "/compact");
    assert!(!ctx.slash_request_id.is_empty());
    assert_eq!(ctx.trace_id.len(), 12);
    assert!(ctx.started_at_ms > 0);
}
