// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::broadcast::ConsumerSink;
use crate::error::{Error, Result};
use crate::rate::TokenBucket;
use crate::session::{ConsumerEntry, ConsumerIdentity, ConsumerRole, SessionState};

/// In-memory consumer sink capturing every delivered frame.
pub struct TestSink {
    frames: Mutex<Vec<Value>>,
    closed: Mutex<Option<(u16, String)>>,
    fail_sends: AtomicBool,
}

impl TestSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Make every subsequent send fail (dead-socket simulation).
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::Relaxed);
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().clone()
    }

    /// Frames of a given `type` tag.
    pub fn frames_of(&self, tag: &str) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.get("type").and_then(|t| t.as_str()) == Some(tag))
            .cloned()
            .collect()
    }

    pub fn close_code(&self) -> Option<u16> {
        self.closed.lock().as_ref().map(|(code, _)| *code)
    }

    pub fn seqs(&self) -> Vec<u64> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| f.get("seq").and_then(|s| s.as_u64()))
            .collect()
    }
}

#[async_trait]
impl ConsumerSink for TestSink {
    async fn send_text(&self, text: String) -> Result<()> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(Error::Connection("sink closed".to_owned()));
        }
        let value: Value = serde_json::from_str(&text)?;
        self.frames.lock().push(value);
        Ok(())
    }

    async fn close(&self, code: u16, reason: String) {
        *self.closed.lock() = Some((code, reason));
    }
}

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique socket id for tests.
pub fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Register a test consumer on a session, returning its socket id and sink.
pub fn add_test_consumer(state: &mut SessionState, name: &str) -> (u64, Arc<TestSink>) {
    let sink = TestSink::new();
    let socket_id = next_socket_id();
    state.consumers.insert(
        socket_id,
        ConsumerEntry {
            sink: sink.clone(),
            identity: ConsumerIdentity {
                user_id: format!("user-{name}"),
                display_name: name.to_owned(),
                role: ConsumerRole::Participant,
            },
            bucket: TokenBucket::new(1000, 1000.0),
        },
    );
    (socket_id, sink)
}
