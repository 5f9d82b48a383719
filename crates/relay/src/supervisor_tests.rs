// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;

fn sleep_opts(secs: &str) -> SpawnOptions {
    SpawnOptions::new("sleep").with_args(vec![secs.to_owned()]).with_source("sleeper")
}

fn echo_opts(text: &str) -> SpawnOptions {
    SpawnOptions::new("echo").with_args(vec![text.to_owned()]).with_source("echoer")
}

async fn wait_for_exit(
    rx: &mut tokio::sync::broadcast::Receiver<ProcessEvent>,
) -> Option<(Option<i32>, u64)> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(ProcessEvent::Exited { exit_code, uptime_ms, .. })) => {
                return Some((exit_code, uptime_ms))
            }
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn spawn_emits_spawned_then_exited() -> anyhow::Result<()> {
    let supervisor = Arc::new(ProcessSupervisor::new());
    let mut rx = supervisor.subscribe();

    let pid = supervisor.spawn_process("s1", echo_opts("hi")).await?;
    assert!(pid > 0);

    // Stdout and exit events come from independent tasks; collect until
    // all three kinds have shown up.
    let mut saw_spawned = false;
    let mut saw_stdout = false;
    let mut saw_exited = false;
    while !(saw_spawned && saw_stdout && saw_exited) {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(ProcessEvent::Spawned { session_id, .. })) => {
                assert_eq!(session_id, "s1");
                saw_spawned = true;
            }
            Ok(Ok(ProcessEvent::Stdout { chunk, .. })) => {
                assert!(chunk.contains("hi"));
                saw_stdout = true;
            }
            Ok(Ok(ProcessEvent::Exited { exit_code, .. })) => {
                assert_eq!(exit_code, Some(0));
                saw_exited = true;
            }
            other => anyhow::bail!("unexpected event: {other:?}"),
        }
    }
    assert!(supervisor.pid_of("s1").await.is_none());
    Ok(())
}

#[tokio::test]
async fn kill_unknown_session_returns_false() {
    let supervisor = Arc::new(ProcessSupervisor::new());
    assert!(!supervisor.kill_process("ghost").await);
}

#[tokio::test]
async fn kill_terminates_and_second_kill_is_noop() -> anyhow::Result<()> {
    let supervisor = Arc::new(ProcessSupervisor::new());
    let mut rx = supervisor.subscribe();
    supervisor.spawn_process("s1", sleep_opts("30")).await?;

    assert!(supervisor.kill_process("s1").await);
    let exited = wait_for_exit(&mut rx).await;
    assert!(exited.is_some(), "process should exit after SIGTERM");

    // Entry removed; a second kill is a no-op returning false.
    assert!(!supervisor.kill_process("s1").await);
    Ok(())
}

#[tokio::test]
async fn duplicate_spawn_for_live_session_refused() -> anyhow::Result<()> {
    let supervisor = Arc::new(ProcessSupervisor::new());
    supervisor.spawn_process("s1", sleep_opts("30")).await?;
    let second = supervisor.spawn_process("s1", sleep_opts("30")).await;
    assert!(second.is_err());
    supervisor.kill_process("s1").await;
    Ok(())
}

#[tokio::test]
async fn breaker_opens_after_five_fast_crashes() -> anyhow::Result<()> {
    // `true` exits immediately, far below any sane crash threshold.
    let supervisor =
        Arc::new(ProcessSupervisor::new().with_crash_threshold(Duration::from_millis(100)));
    let mut rx = supervisor.subscribe();

    for i in 0..5 {
        let opts = SpawnOptions::new("true").with_source("crashy");
        supervisor.spawn_process(&format!("s{i}"), opts).await?;
        assert!(wait_for_exit(&mut rx).await.is_some());
    }

    let state = supervisor.breaker_state("crashy").await;
    assert_eq!(state.consecutive_crashes(), 5);
    assert!(state.is_open());

    let refused = supervisor
        .spawn_process("s6", SpawnOptions::new("true").with_source("crashy"))
        .await;
    assert!(refused.is_err());
    Ok(())
}

#[tokio::test]
async fn long_run_resets_breaker() {
    let mut breaker = CircuitBreaker::default();
    let threshold = Duration::from_millis(100);
    for _ in 0..4 {
        breaker.record_exit(Duration::from_millis(1), threshold);
    }
    assert!(!breaker.is_open());
    breaker.record_exit(Duration::from_secs(2), threshold);
    assert_eq!(breaker.consecutive_crashes(), 0);
    for _ in 0..5 {
        breaker.record_exit(Duration::from_millis(1), threshold);
    }
    assert!(breaker.is_open());
}

#[tokio::test]
async fn source_prefix_partitions_breakers() -> anyhow::Result<()> {
    let supervisor = Arc::new(
        ProcessSupervisor::new()
            .with_crash_threshold(Duration::from_millis(100))
            .with_source_prefix("acp"),
    );
    let mut rx = supervisor.subscribe();
    supervisor.spawn_process("s1", SpawnOptions::new("true").with_source("agent")).await?;
    assert!(wait_for_exit(&mut rx).await.is_some());

    assert_eq!(supervisor.breaker_state("acp:agent").await.consecutive_crashes(), 1);
    assert_eq!(supervisor.breaker_state("agent").await.consecutive_crashes(), 0);
    Ok(())
}

#[tokio::test]
async fn launcher_tracks_starting_sessions() -> anyhow::Result<()> {
    let supervisor = Arc::new(ProcessSupervisor::new());
    let launcher = ProcessLauncher::new(Arc::clone(&supervisor));

    launcher.register("s1", LaunchSpec { options: sleep_opts("30") }).await;
    launcher.register("s2", LaunchSpec { options: sleep_opts("30") }).await;
    let mut starting = launcher.starting_sessions().await;
    starting.sort();
    assert_eq!(starting, vec!["s1", "s2"]);

    launcher.mark_connected("s1").await;
    assert_eq!(launcher.starting_sessions().await, vec!["s2"]);

    launcher.mark_disconnected("s1").await;
    let mut starting = launcher.starting_sessions().await;
    starting.sort();
    assert_eq!(starting, vec!["s1", "s2"]);

    launcher.stop_all().await;
    assert!(launcher.starting_sessions().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn launcher_relaunch_respawns() -> anyhow::Result<()> {
    let supervisor = Arc::new(ProcessSupervisor::new());
    let launcher = ProcessLauncher::new(Arc::clone(&supervisor));
    launcher.register("s1", LaunchSpec { options: sleep_opts("30") }).await;

    let first = launcher.launch("s1").await?;
    let second = launcher.relaunch("s1").await?;
    assert_ne!(first, second);

    launcher.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn launch_without_spec_fails() {
    let supervisor = Arc::new(ProcessSupervisor::new());
    let launcher = ProcessLauncher::new(supervisor);
    assert!(launcher.launch("missing").await.is_err());
}
