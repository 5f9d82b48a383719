// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fan-out of consumer frames to every socket of a session.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::protocol::ConsumerMessage;
use crate::session::SessionState;

/// One consumer connection as the broadcaster sees it.
///
/// The WS server wraps real sockets; tests use in-memory sinks.
#[async_trait]
pub trait ConsumerSink: Send + Sync {
    /// Deliver one JSON text frame.
    async fn send_text(&self, text: String) -> Result<()>;

    /// Close the connection with a code and reason.
    async fn close(&self, code: u16, reason: String);
}

/// Frames that joining consumers should see again in `message_history`.
///
/// Connection-scoped frames (identity, snapshots, presence, the history
/// frame itself, per-socket errors) are not replayed.
fn is_replayable(msg: &ConsumerMessage) -> bool {
    !matches!(
        msg,
        ConsumerMessage::Identity { .. }
            | ConsumerMessage::SessionInit { .. }
            | ConsumerMessage::MessageHistory { .. }
            | ConsumerMessage::PresenceUpdate { .. }
            | ConsumerMessage::Error { .. }
    )
}

/// Serialize a frame with the session sequence number stamped in.
fn stamp(msg: &ConsumerMessage, seq: u64) -> Result<Value> {
    let mut value = serde_json::to_value(msg)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("seq".to_owned(), json!(seq));
    }
    Ok(value)
}

/// Stateless fan-out helper operating on a session's consumer roster.
pub struct Broadcaster;

impl Broadcaster {
    /// Send `msg` to every consumer of the session.
    ///
    /// Stamps the next sequence number, appends replayable frames to the
    /// history ring, and isolates per-sink send failures.
    pub async fn broadcast(state: &mut SessionState, msg: &ConsumerMessage) -> u64 {
        let seq = state.sequencer.next_seq();
        let value = match stamp(msg, seq) {
            Ok(v) => v,
            Err(e) => {
                debug!(err = %e, "dropping unserializable broadcast frame");
                return seq;
            }
        };
        if is_replayable(msg) {
            state.history.push(value.clone());
        }
        let text = value.to_string();
        for entry in state.consumers.values() {
            if let Err(e) = entry.sink.send_text(text.clone()).await {
                // One slow or dead socket must not affect the rest.
                debug!(user = %entry.identity.user_id, err = %e, "broadcast send failed");
            }
        }
        seq
    }

    /// Send `msg` to a single socket, stamped with the next sequence number.
    pub async fn send_to(state: &mut SessionState, socket_id: u64, msg: &ConsumerMessage) -> u64 {
        let seq = state.sequencer.next_seq();
        let Ok(value) = stamp(msg, seq) else {
            return seq;
        };
        if let Some(entry) = state.consumers.get(&socket_id) {
            if let Err(e) = entry.sink.send_text(value.to_string()).await {
                debug!(socket_id, err = %e, "direct send failed");
            }
        }
        seq
    }

    /// Broadcast the current presence snapshot.
    pub async fn broadcast_presence(state: &mut SessionState) {
        let msg = ConsumerMessage::PresenceUpdate {
            consumers: state.presence(),
            count: state.consumer_count(),
        };
        Self::broadcast(state, &msg).await;
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;
