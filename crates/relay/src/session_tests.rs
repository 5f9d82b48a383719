// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[yare::parameterized(
    created_to_active = { LifecycleState::Created, LifecycleState::Active, true },
    created_to_closing = { LifecycleState::Created, LifecycleState::Closing, true },
    created_to_idle = { LifecycleState::Created, LifecycleState::Idle, false },
    active_to_idle = { LifecycleState::Active, LifecycleState::Idle, true },
    idle_to_active = { LifecycleState::Idle, LifecycleState::Active, true },
    active_to_degraded = { LifecycleState::Active, LifecycleState::Degraded, true },
    degraded_to_active = { LifecycleState::Degraded, LifecycleState::Active, true },
    degraded_to_idle = { LifecycleState::Degraded, LifecycleState::Idle, false },
    idle_to_closing = { LifecycleState::Idle, LifecycleState::Closing, true },
    degraded_to_closing = { LifecycleState::Degraded, LifecycleState::Closing, true },
    closing_to_closed = { LifecycleState::Closing, LifecycleState::Closed, true },
    closing_to_active = { LifecycleState::Closing, LifecycleState::Active, false },
    closed_is_terminal = { LifecycleState::Closed, LifecycleState::Closing, false },
    closed_to_active = { LifecycleState::Closed, LifecycleState::Active, false },
    self_transition = { LifecycleState::Active, LifecycleState::Active, false },
)]
fn lifecycle_table(from: LifecycleState, to: LifecycleState, valid: bool) {
    assert_eq!(from.can_transition(to), valid);
}

#[test]
fn transition_applies_or_reports_pair() {
    let mut state = SessionState::new("s1");
    assert_eq!(state.lifecycle, LifecycleState::Created);

    assert!(state.transition(LifecycleState::Active).is_ok());
    assert_eq!(state.lifecycle, LifecycleState::Active);

    let err = state.transition(LifecycleState::Created);
    assert_eq!(err, Err((LifecycleState::Active, LifecycleState::Created)));
    assert_eq!(state.lifecycle, LifecycleState::Active, "state untouched on invalid transition");
}

#[test]
fn history_ring_trims_oldest() {
    let mut ring = HistoryRing::new(3);
    for i in 0..5 {
        ring.push(json!({"seq": i}));
    }
    assert_eq!(ring.len(), 3);
    let seqs: Vec<u64> =
        ring.snapshot().iter().filter_map(|f| f["seq"].as_u64()).collect();
    assert_eq!(seqs, vec![2, 3, 4]);
}

#[test]
fn history_ring_empty_snapshot() {
    let ring = HistoryRing::new(8);
    assert!(ring.is_empty());
    assert!(ring.snapshot().is_empty());
}

#[test]
fn snapshot_carries_declared_keys() {
    let mut state = SessionState::new("s1");
    state.state.insert("cwd".to_owned(), json!("/tmp"));
    state.state.insert("model".to_owned(), json!("opus"));
    state.adapter_name = Some("mock".to_owned());
    state.last_status = Some(BackendStatus::Running);
    state.name = Some("first prompt".to_owned());

    let snap = state.snapshot();
    assert_eq!(snap["session_id"], "s1");
    assert_eq!(snap["cwd"], "/tmp");
    assert_eq!(snap["model"], "opus");
    assert_eq!(snap["adapterName"], "mock");
    assert_eq!(snap["lifecycle"], "created");
    assert_eq!(snap["status"], "running");
    assert_eq!(snap["name"], "first prompt");
}

#[test]
fn anon_names_increment() {
    let mut state = SessionState::new("s1");
    assert_eq!(state.next_anon_name(), "guest-1");
    assert_eq!(state.next_anon_name(), "guest-2");
    assert_eq!(state.next_anon_name(), "guest-3");
}

#[test]
fn backend_status_strings() {
    assert_eq!(BackendStatus::from_str_opt("running"), Some(BackendStatus::Running));
    assert_eq!(BackendStatus::from_str_opt("idle"), Some(BackendStatus::Idle));
    assert_eq!(BackendStatus::from_str_opt("compacting"), Some(BackendStatus::Compacting));
    assert_eq!(BackendStatus::from_str_opt("sleeping"), None);
}

mod ring_props {
    use proptest::prelude::*;
    use serde_json::json;

    use crate::session::HistoryRing;

    proptest! {
        #[test]
        fn ring_never_exceeds_cap_and_keeps_newest(cap in 1usize..16, n in 0usize..64) {
            let mut ring = HistoryRing::new(cap);
            for i in 0..n {
                ring.push(json!({"i": i}));
            }
            prop_assert!(ring.len() <= cap);
            let snapshot = ring.snapshot();
            prop_assert_eq!(snapshot.len(), n.min(cap));
            // Newest survive, in order.
            for (offset, frame) in snapshot.iter().enumerate() {
                let expected = n - n.min(cap) + offset;
                prop_assert_eq!(frame["i"].as_u64(), Some(expected as u64));
            }
        }
    }
}
