// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::adapter::inproc::{echo_query, InprocAdapter};
use crate::adapter::BackendAdapter;
use crate::test_support::TestSink;

fn echo_resolver() -> Arc<AdapterResolver> {
    let resolver = AdapterResolver::new();
    resolver.register("mock", || {
        Arc::new(InprocAdapter::new("mock", echo_query())) as Arc<dyn BackendAdapter>
    });
    Arc::new(resolver)
}

fn open_bridge() -> Arc<SessionBridge> {
    SessionBridge::new(
        echo_resolver(),
        Arc::new(OpenAccess),
        EventBus::new(),
        BridgeConfig::default(),
    )
}

async fn wait_for_frames(sink: &Arc<TestSink>, tag: &str, count: usize) -> anyhow::Result<()> {
    for _ in 0..200 {
        if sink.frames_of(tag).len() >= count {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("never saw {count} `{tag}` frame(s); got {:?}", sink.frames())
}

#[tokio::test]
async fn open_unknown_session_closes_4404() {
    let bridge = open_bridge();
    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("missing", sink.clone() as Arc<dyn ConsumerSink>, None)
        .await;
    assert!(socket.is_none());
    assert_eq!(sink.close_code(), Some(4404));
}

#[tokio::test]
async fn auth_failure_closes_4401() {
    let bridge = SessionBridge::new(
        echo_resolver(),
        Arc::new(TokenAuthenticator::new("secret")),
        EventBus::new(),
        BridgeConfig::default(),
    );
    let mut events = bridge.bus().subscribe();
    bridge.create_session("s1", SessionSeed::default()).await;

    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("s1", sink.clone() as Arc<dyn ConsumerSink>, Some("wrong"))
        .await;
    assert!(socket.is_none());
    assert_eq!(sink.close_code(), Some(4401));

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::ConsumerAuthFailed { .. }) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn valid_token_accepted() {
    let bridge = SessionBridge::new(
        echo_resolver(),
        Arc::new(TokenAuthenticator::new("secret")),
        EventBus::new(),
        BridgeConfig::default(),
    );
    bridge.create_session("s1", SessionSeed::default()).await;

    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("s1", sink.clone() as Arc<dyn ConsumerSink>, Some("secret"))
        .await;
    assert!(socket.is_some());
    assert!(sink.close_code().is_none());
}

#[tokio::test]
async fn welcome_sequence_identity_init_history() -> anyhow::Result<()> {
    let bridge = open_bridge();
    bridge
        .create_session(
            "s1",
            SessionSeed { cwd: Some("/tmp".to_owned()), ..SessionSeed::default() },
        )
        .await;

    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("s1", sink.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open failed"))?;
    let _ = socket;

    wait_for_frames(&sink, "presence_update", 1).await?;
    let frames = sink.frames();
    assert_eq!(frames[0]["type"], "identity");
    assert!(frames[0]["display_name"].as_str().is_some_and(|n| n.starts_with("guest-")));
    assert_eq!(frames[1]["type"], "session_init");
    assert_eq!(frames[1]["session"]["cwd"], "/tmp");
    assert_eq!(frames[2]["type"], "message_history");
    assert_eq!(frames[3]["type"], "presence_update");
    Ok(())
}

#[tokio::test]
async fn replay_is_prefix_of_live_frames() -> anyhow::Result<()> {
    let bridge = open_bridge();
    bridge.create_session("s1", SessionSeed { adapter_name: Some("mock".to_owned()), ..Default::default() }).await;
    bridge.connect_backend("s1", serde_json::Map::new()).await?;

    let first = TestSink::new();
    let first_socket = bridge
        .handle_consumer_open("s1", first.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open failed"))?;

    bridge
        .handle_consumer_message("s1", first_socket, r#"{"type":"user_message","content":"ping"}"#)
        .await;
    wait_for_frames(&first, "result", 1).await?;

    // A late joiner's history must be a prefix of what the first consumer
    // saw (replayable frames only), by seq.
    let second = TestSink::new();
    bridge
        .handle_consumer_open("s1", second.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("second open failed"))?;
    wait_for_frames(&second, "message_history", 1).await?;

    let history = second.frames_of("message_history");
    let replayed = history[0]["messages"].as_array().cloned().unwrap_or_default();
    assert!(!replayed.is_empty());

    // Everything the first consumer observed, in order: its own replay
    // followed by live replayable frames.
    let mut observed_seqs: Vec<u64> = first.frames_of("message_history")[0]["messages"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|f| f["seq"].as_u64())
        .collect();
    observed_seqs.extend(
        first
            .frames()
            .iter()
            .filter(|f| {
                let t = f["type"].as_str().unwrap_or("");
                !matches!(
                    t,
                    "identity" | "session_init" | "message_history" | "presence_update" | "error"
                )
            })
            .filter_map(|f| f["seq"].as_u64()),
    );
    let replay_seqs: Vec<u64> = replayed.iter().filter_map(|f| f["seq"].as_u64()).collect();
    assert!(replay_seqs.len() <= observed_seqs.len());
    assert_eq!(
        &observed_seqs[..replay_seqs.len()],
        replay_seqs.as_slice(),
        "replay must be a prefix of what the first consumer observed"
    );
    Ok(())
}

#[tokio::test]
async fn oversized_frame_closes_1009_without_mutation() -> anyhow::Result<()> {
    let bridge = open_bridge();
    bridge.create_session("s1", SessionSeed::default()).await;
    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("s1", sink.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open failed"))?;

    let big = format!(
        r#"{{"type":"user_message","content":"{}"}}"#,
        "x".repeat(300 * 1024)
    );
    bridge.handle_consumer_message("s1", socket, &big).await;

    assert_eq!(sink.close_code(), Some(1009));
    let runtime = bridge.get("s1").await.ok_or_else(|| anyhow::anyhow!("gone"))?;
    assert_eq!(runtime.with_state(|s| s.consumer_count()).await, 0);
    assert!(runtime.with_state(|s| s.history.is_empty()).await, "no runtime mutation");
    Ok(())
}

#[tokio::test]
async fn invalid_json_gets_error_frame() -> anyhow::Result<()> {
    let bridge = open_bridge();
    bridge.create_session("s1", SessionSeed::default()).await;
    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("s1", sink.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open failed"))?;

    bridge.handle_consumer_message("s1", socket, "this is not json").await;
    wait_for_frames(&sink, "error", 1).await?;
    let errors = sink.frames_of("error");
    assert!(errors[0]["message"].as_str().is_some_and(|m| m.contains("invalid message")));
    Ok(())
}

#[tokio::test]
async fn rate_limit_sends_error_frame() -> anyhow::Result<()> {
    let bridge = SessionBridge::new(
        echo_resolver(),
        Arc::new(OpenAccess),
        EventBus::new(),
        BridgeConfig { rate_capacity: 2, rate_refill_per_sec: 0.01, ..Default::default() },
    );
    bridge.create_session("s1", SessionSeed::default()).await;
    let sink = TestSink::new();
    let socket = bridge
        .handle_consumer_open("s1", sink.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open failed"))?;

    for _ in 0..3 {
        bridge
            .handle_consumer_message("s1", socket, r#"{"type":"presence_query"}"#)
            .await;
    }
    wait_for_frames(&sink, "error", 1).await?;
    let errors = sink.frames_of("error");
    assert!(errors[0]["message"].as_str().is_some_and(|m| m.contains("rate limit")));
    Ok(())
}

#[tokio::test]
async fn consumer_close_updates_presence() -> anyhow::Result<()> {
    let bridge = open_bridge();
    bridge.create_session("s1", SessionSeed::default()).await;
    let a = TestSink::new();
    let b = TestSink::new();
    let socket_a = bridge
        .handle_consumer_open("s1", a.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open a failed"))?;
    bridge
        .handle_consumer_open("s1", b.clone() as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open b failed"))?;

    bridge.handle_consumer_close("s1", socket_a).await;
    let runtime = bridge.get("s1").await.ok_or_else(|| anyhow::anyhow!("gone"))?;
    assert_eq!(runtime.with_state(|s| s.consumer_count()).await, 1);

    // b saw a presence update with count 1 at the end.
    wait_for_frames(&b, "presence_update", 2).await?;
    let presence = b.frames_of("presence_update");
    assert_eq!(presence.last().map(|p| p["count"].clone()), Some(json!(1)));
    Ok(())
}

#[tokio::test]
async fn open_without_backend_emits_relaunch_needed() -> anyhow::Result<()> {
    let bridge = open_bridge();
    let mut events = bridge.bus().subscribe();
    bridge.create_session("s1", SessionSeed::default()).await;
    let sink = TestSink::new();
    bridge
        .handle_consumer_open("s1", sink as Arc<dyn ConsumerSink>, None)
        .await
        .ok_or_else(|| anyhow::anyhow!("open failed"))?;

    let mut saw_relaunch = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::BackendRelaunchNeeded { .. }) {
            saw_relaunch = true;
        }
    }
    assert!(saw_relaunch);
    Ok(())
}

#[tokio::test]
async fn connect_backend_requires_adapter() {
    let bridge = open_bridge();
    bridge.create_session("s1", SessionSeed::default()).await;
    let result = bridge.connect_backend("s1", serde_json::Map::new()).await;
    assert!(matches!(result, Err(Error::NoAdapter(_))));
}

#[tokio::test]
async fn connect_backend_round_trip() -> anyhow::Result<()> {
    let bridge = open_bridge();
    let mut events = bridge.bus().subscribe();
    bridge
        .create_session("s1", SessionSeed { adapter_name: Some("mock".to_owned()), ..Default::default() })
        .await;
    bridge.connect_backend("s1", serde_json::Map::new()).await?;

    let runtime = bridge.get("s1").await.ok_or_else(|| anyhow::anyhow!("gone"))?;
    assert!(runtime.backend_attached().await);

    // backend:connected arrives before backend:session_id.
    let mut order = Vec::new();
    for _ in 0..200 {
        while let Ok(event) = events.try_recv() {
            match event {
                DomainEvent::BackendConnected { .. } => order.push("connected"),
                DomainEvent::BackendSessionId { .. } => order.push("session_id"),
                _ => {}
            }
        }
        if order.contains(&"session_id") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(order.first(), Some(&"connected"));
    assert!(order.contains(&"session_id"));
    Ok(())
}

#[tokio::test]
async fn close_all_closes_every_session() -> anyhow::Result<()> {
    let bridge = open_bridge();
    bridge.create_session("a", SessionSeed::default()).await;
    bridge.create_session("b", SessionSeed::default()).await;
    assert_eq!(bridge.session_ids().await, vec!["a", "b"]);

    bridge.close_all().await;
    assert!(bridge.session_ids().await.is_empty());
    Ok(())
}
