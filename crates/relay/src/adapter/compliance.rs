// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapter compliance suite.
//!
//! Every shipped adapter family runs these checks from its own test module
//! against a real or mocked transport. A new family that passes the suite
//! will behave correctly under the session runtime.

use std::time::Duration;

use serde_json::Value;

use super::{BackendAdapter, ConnectOptions};
use crate::error::Error;
use crate::message::{is_unified_message, Role, UnifiedMessage, UnifiedType};

fn user_message(text: &str) -> UnifiedMessage {
    UnifiedMessage::new(UnifiedType::UserMessage, Role::User).with_text(text)
}

/// (a) Name and capabilities are well-formed.
pub fn check_identity(adapter: &dyn BackendAdapter) -> anyhow::Result<()> {
    anyhow::ensure!(!adapter.name().is_empty(), "adapter name must be non-empty");
    anyhow::ensure!(
        adapter.name().chars().all(|c| c.is_ascii_lowercase() || c == '-' || c == '_'),
        "adapter name should be a stable lowercase identifier"
    );
    // Capabilities just need to be readable; flag values are family policy.
    let _ = adapter.capabilities();
    Ok(())
}

/// (b) `connect` returns a session carrying the supplied id, and
/// (f) the resume option is accepted.
pub async fn check_connect(
    adapter: &dyn BackendAdapter,
    options: ConnectOptions,
) -> anyhow::Result<()> {
    let session_id = options.session_id.clone();
    let session = adapter.connect(options.clone()).await?;
    anyhow::ensure!(session.session_id() == session_id, "session must echo the supplied id");
    session.close().await;

    let resumed = adapter
        .connect(
            ConnectOptions {
                session_id: format!("{session_id}-resume"),
                resume: Some("backend-prior".to_owned()),
                adapter_options: options.adapter_options,
            },
        )
        .await?;
    resumed.close().await;
    Ok(())
}

/// (c) Send then iterate yields at least one valid unified message, and
/// (d) close terminates the stream and fails subsequent sends.
pub async fn check_stream_and_close(
    adapter: &dyn BackendAdapter,
    options: ConnectOptions,
) -> anyhow::Result<()> {
    let session = adapter.connect(options).await?;
    let mut messages =
        session.take_messages().ok_or_else(|| anyhow::anyhow!("message stream missing"))?;
    anyhow::ensure!(session.take_messages().is_none(), "stream must have at most one consumer");

    session.send(user_message("compliance ping")).await?;

    let first = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no message within 5s of send"))?
        .ok_or_else(|| anyhow::anyhow!("stream ended before yielding a message"))?;
    let as_value: Value = serde_json::to_value(&first)?;
    anyhow::ensure!(is_unified_message(&as_value), "yielded message failed the shape guard");

    session.close().await;
    session.close().await; // idempotent

    // Stream must drain to end-of-stream.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while messages.recv().await.is_some() {}
    })
    .await;
    anyhow::ensure!(ended.is_ok(), "stream did not end after close");

    match session.send(user_message("after close")).await {
        Err(Error::SessionClosed) => {}
        Err(other) => anyhow::bail!("send after close: expected SessionClosed, got {other}"),
        Ok(()) => anyhow::bail!("send after close unexpectedly succeeded"),
    }
    Ok(())
}

/// (e) Two concurrent sessions are independent: closing one leaves the
/// other able to send and receive.
pub async fn check_isolation(
    adapter: &dyn BackendAdapter,
    options_a: ConnectOptions,
    options_b: ConnectOptions,
) -> anyhow::Result<()> {
    let a = adapter.connect(options_a).await?;
    let b = adapter.connect(options_b).await?;
    let mut b_messages =
        b.take_messages().ok_or_else(|| anyhow::anyhow!("session b stream missing"))?;

    a.close().await;

    b.send(user_message("still alive")).await?;
    let got = tokio::time::timeout(Duration::from_secs(5), b_messages.recv())
        .await
        .map_err(|_| anyhow::anyhow!("session b starved after closing a"))?;
    anyhow::ensure!(got.is_some(), "session b stream ended when a closed");

    b.close().await;
    Ok(())
}
