// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end gateway scenarios against the in-process echo backend.
//!
//! The consumer side uses in-memory sinks speaking raw protocol frames;
//! socket-level behavior (close codes, origin policy) lives in the server
//! unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use relay::adapter::inproc::{echo_query, scripted_query, AgentQuery, InprocAdapter, QueryContext};
use relay::adapter::{AdapterResolver, BackendAdapter};
use relay::bridge::{BridgeConfig, OpenAccess, SessionBridge, SessionSeed};
use relay::broadcast::ConsumerSink;
use relay::coordinator::{CreateSessionOptions, SessionCoordinator};
use relay::events::{DomainEvent, EventBus};
use relay::message::{Role, UnifiedMessage, UnifiedType};
use relay::policy::WatchdogConfig;
use relay::session::LifecycleState;
use relay::test_support::TestSink;

fn echo_resolver() -> Arc<AdapterResolver> {
    let resolver = AdapterResolver::new();
    resolver.register("mock", || {
        Arc::new(InprocAdapter::new("mock", echo_query())) as Arc<dyn BackendAdapter>
    });
    Arc::new(resolver)
}

fn build_stack(resolver: Arc<AdapterResolver>) -> (Arc<SessionCoordinator>, Arc<SessionBridge>) {
    let bridge = SessionBridge::new(
        Arc::clone(&resolver),
        Arc::new(OpenAccess),
        EventBus::new(),
        BridgeConfig::default(),
    );
    let coordinator = SessionCoordinator::new(
        Arc::clone(&bridge),
        resolver,
        None,
        None,
        WatchdogConfig::default(),
    );
    (coordinator, bridge)
}

async fn wait_for_frames(sink: &Arc<TestSink>, tag: &str, count: usize) -> anyhow::Result<()> {
    for _ in 0..300 {
        if sink.frames_of(tag).len() >= count {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("never saw {count} `{tag}` frame(s); got {:?}", sink.frames())
}

async fn open_consumer(
    bridge: &Arc<SessionBridge>,
    session_id: &str,
) -> anyhow::Result<(u64, Arc<TestSink>)> {
    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open(session_id, sink.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("consumer open failed"))?;
    Ok((socket, sink))
}

// Scenario 1: create a session, send "ping", observe the full turn.
#[tokio::test]
async fn happy_path_single_turn() -> anyhow::Result<()> {
    let (coordinator, bridge) = build_stack(echo_resolver());
    coordinator.start().await;
    let mut events = coordinator.bus().subscribe();

    let session_id = coordinator
        .create_session(CreateSessionOptions {
            cwd: Some("/tmp".to_owned()),
            adapter_name: Some("mock".to_owned()),
            ..Default::default()
        })
        .await?;

    let (socket, sink) = open_consumer(&bridge, &session_id).await?;
    bridge
        .handle_consumer_message(&session_id, socket, r#"{"type":"user_message","content":"ping"}"#)
        .await;

    wait_for_frames(&sink, "result", 1).await?;
    let user = sink.frames_of("user_message");
    assert_eq!(user[0]["content"], "ping");
    let assistant = sink.frames_of("assistant");
    assert_eq!(assistant[0]["message"]["content"][0]["text"], "echo: ping");
    let result = sink.frames_of("result");
    assert_eq!(result[0]["data"]["is_error"], false);

    let mut first_turns = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::FirstTurnCompleted { .. }) {
            first_turns += 1;
        }
    }
    assert_eq!(first_turns, 1, "first_turn_completed fires exactly once");

    coordinator.stop().await;
    Ok(())
}

// Scenario 2: both consumers see the same broadcast with the same seqs.
#[tokio::test]
async fn two_consumers_one_broadcast() -> anyhow::Result<()> {
    let (coordinator, bridge) = build_stack(echo_resolver());
    let session_id = coordinator
        .create_session(CreateSessionOptions {
            adapter_name: Some("mock".to_owned()),
            ..Default::default()
        })
        .await?;

    let (socket_1, c1) = open_consumer(&bridge, &session_id).await?;
    let (_socket_2, c2) = open_consumer(&bridge, &session_id).await?;

    bridge
        .handle_consumer_message(&session_id, socket_1, r#"{"type":"user_message","content":"hi"}"#)
        .await;
    wait_for_frames(&c1, "result", 1).await?;
    wait_for_frames(&c2, "result", 1).await?;

    let a1 = c1.frames_of("assistant");
    let a2 = c2.frames_of("assistant");
    assert_eq!(a1[0]["message"]["content"], a2[0]["message"]["content"]);
    assert_eq!(a1[0]["seq"], a2[0]["seq"]);

    // Each consumer's observed seqs strictly increase.
    for sink in [&c1, &c2] {
        let seqs = sink.seqs();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    }

    coordinator.stop().await;
    Ok(())
}

// Scenario 3: queue while running, auto-flush when the backend goes idle.
#[tokio::test]
async fn queue_then_auto_flush() -> anyhow::Result<()> {
    let (query, handle) = scripted_query();
    let resolver = AdapterResolver::new();
    resolver.register_instance(Arc::new(InprocAdapter::new("mock", query)));
    let resolver = Arc::new(resolver);
    let bridge = SessionBridge::new(
        Arc::clone(&resolver),
        Arc::new(OpenAccess),
        EventBus::new(),
        BridgeConfig::default(),
    );
    bridge
        .create_session("s1", SessionSeed { adapter_name: Some("mock".to_owned()), ..Default::default() })
        .await;
    bridge.connect_backend("s1", serde_json::Map::new()).await?;
    let (socket, sink) = open_consumer(&bridge, "s1").await?;

    // Backend reports running.
    handle
        .emissions
        .send(
            UnifiedMessage::new(UnifiedType::StatusChange, Role::System)
                .with_meta("status", json!("running")),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    wait_for_frames(&sink, "status_change", 1).await?;

    bridge
        .handle_consumer_message("s1", socket, r#"{"type":"queue_message","content":"later"}"#)
        .await;
    wait_for_frames(&sink, "message_queued", 1).await?;

    // Backend goes idle: queued_message_sent, then the user message.
    handle
        .emissions
        .send(
            UnifiedMessage::new(UnifiedType::StatusChange, Role::System)
                .with_meta("status", json!("idle")),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    wait_for_frames(&sink, "queued_message_sent", 1).await?;
    wait_for_frames(&sink, "user_message", 1).await?;
    assert_eq!(sink.frames_of("user_message")[0]["content"], "later");

    let prompt = tokio::time::timeout(Duration::from_secs(2), async {
        handle.prompts.lock().await.recv().await
    })
    .await?
    .ok_or_else(|| anyhow::anyhow!("flushed prompt never reached the backend"))?;
    assert_eq!(prompt.text(), "later");
    Ok(())
}

// Scenario 4: the adapter asks for permission, the consumer denies it.
#[tokio::test]
async fn permission_deny_round_trip() -> anyhow::Result<()> {
    let (coordinator, bridge) = build_stack(echo_resolver());
    let mut events = coordinator.bus().subscribe();
    let session_id = coordinator
        .create_session(CreateSessionOptions {
            adapter_name: Some("mock".to_owned()),
            ..Default::default()
        })
        .await?;
    let (socket, sink) = open_consumer(&bridge, &session_id).await?;

    bridge
        .handle_consumer_message(
            &session_id,
            socket,
            r#"{"type":"user_message","content":"run: rm -rf /"}"#,
        )
        .await;

    wait_for_frames(&sink, "permission_request", 1).await?;
    let request = &sink.frames_of("permission_request")[0];
    assert_eq!(request["request"]["tool_name"], "Bash");
    let request_id = request["request"]["request_id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("no request_id"))?
        .to_owned();

    let deny = json!({
        "type": "permission_response",
        "request_id": request_id,
        "behavior": "deny",
        "message": "too dangerous",
    });
    bridge.handle_consumer_message(&session_id, socket, &deny.to_string()).await;

    // The adapter observes the deny: the echo query reports a denied tool
    // and an error result with a null stop reason.
    wait_for_frames(&sink, "result", 1).await?;
    let summary = sink.frames_of("tool_use_summary");
    assert_eq!(summary[0]["summary"]["denied"], true);
    let result = sink.frames_of("result");
    assert_eq!(result[0]["data"]["is_error"], true);
    assert_eq!(result[0]["data"]["stop_reason"], serde_json::Value::Null);

    let mut saw_resolved = false;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::PermissionResolved { behavior, .. } = event {
            assert_eq!(behavior, "deny");
            saw_resolved = true;
        }
    }
    assert!(saw_resolved, "permission:resolved must fire");

    coordinator.stop().await;
    Ok(())
}

/// Echo backend whose current run can be killed externally, simulating a
/// backend crash mid-session.
struct KillableEcho {
    kill: broadcast::Sender<()>,
}

#[async_trait]
impl AgentQuery for KillableEcho {
    async fn run(&self, mut ctx: QueryContext) {
        let mut kill = self.kill.subscribe();
        loop {
            tokio::select! {
                _ = kill.recv() => return,
                prompt = ctx.next_prompt() => {
                    let Some(prompt) = prompt else { return };
                    let text = prompt.text();
                    let assistant = UnifiedMessage::new(UnifiedType::Assistant, Role::Assistant)
                        .with_text(format!("echo: {text}"));
                    if !ctx.emit(assistant).await {
                        return;
                    }
                    let result = UnifiedMessage::new(UnifiedType::Result, Role::System)
                        .with_meta("is_error", json!(false));
                    if !ctx.emit(result).await {
                        return;
                    }
                }
            }
        }
    }
}

// Scenario 5: backend dies mid-session; a joining consumer triggers a
// relaunch and the second turn succeeds.
#[tokio::test]
async fn crash_then_reconnect() -> anyhow::Result<()> {
    let (kill_tx, _) = broadcast::channel(4);
    let resolver = AdapterResolver::new();
    let query = Arc::new(KillableEcho { kill: kill_tx.clone() });
    resolver.register_instance(Arc::new(InprocAdapter::new("mock", query)));
    let (coordinator, bridge) = build_stack(Arc::new(resolver));
    coordinator.start().await;
    let mut events = coordinator.bus().subscribe();

    let session_id = coordinator
        .create_session(CreateSessionOptions {
            adapter_name: Some("mock".to_owned()),
            ..Default::default()
        })
        .await?;
    let (socket, sink) = open_consumer(&bridge, &session_id).await?;

    bridge
        .handle_consumer_message(&session_id, socket, r#"{"type":"user_message","content":"one"}"#)
        .await;
    wait_for_frames(&sink, "result", 1).await?;

    // Kill the backend.
    let _ = kill_tx.send(());
    let runtime = bridge.get(&session_id).await.ok_or_else(|| anyhow::anyhow!("gone"))?;
    for _ in 0..300 {
        if runtime.with_state(|s| s.lifecycle).await == LifecycleState::Degraded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runtime.with_state(|s| s.lifecycle).await, LifecycleState::Degraded);

    let mut saw_disconnected = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::BackendDisconnected { .. }) {
            saw_disconnected = true;
        }
    }
    assert!(saw_disconnected);

    // A new consumer joins; the coordinator relaunches the backend.
    let (socket_2, sink_2) = open_consumer(&bridge, &session_id).await?;
    for _ in 0..300 {
        if runtime.backend_attached().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(runtime.backend_attached().await, "backend should be relaunched");
    assert_eq!(runtime.with_state(|s| s.lifecycle).await, LifecycleState::Active);

    // Second turn succeeds.
    bridge
        .handle_consumer_message(&session_id, socket_2, r#"{"type":"user_message","content":"two"}"#)
        .await;
    wait_for_frames(&sink_2, "assistant", 1).await?;
    assert_eq!(
        sink_2.frames_of("assistant")[0]["message"]["content"][0]["text"],
        "echo: two"
    );

    coordinator.stop().await;
    Ok(())
}

// Boundary: empty consumer message gets an error frame.
#[tokio::test]
async fn empty_message_gets_error_frame() -> anyhow::Result<()> {
    let (coordinator, bridge) = build_stack(echo_resolver());
    let session_id = coordinator
        .create_session(CreateSessionOptions {
            adapter_name: Some("mock".to_owned()),
            ..Default::default()
        })
        .await?;
    let (socket, sink) = open_consumer(&bridge, &session_id).await?;

    bridge.handle_consumer_message(&session_id, socket, "").await;
    wait_for_frames(&sink, "error", 1).await?;

    coordinator.stop().await;
    Ok(())
}
