// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-process supervision: spawn, stream stdio, escalate kills, and
//! refuse to respawn sources that keep crashing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Exits faster than this count as crashes for the circuit breaker.
pub const DEFAULT_CRASH_THRESHOLD: Duration = Duration::from_millis(100);

/// Consecutive crashes after which a source's breaker opens.
pub const CRASH_TRIP_COUNT: u32 = 5;

/// SIGTERM grace before escalation to SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Events emitted by the supervisor for every tracked process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Spawned { session_id: String, pid: u32 },
    Exited { session_id: String, exit_code: Option<i32>, uptime_ms: u64 },
    Stdout { session_id: String, chunk: String },
    Stderr { session_id: String, chunk: String },
}

/// What to spawn for a session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Circuit-breaker source tag. Defaults to the command name.
    pub source: Option<String>,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), args: Vec::new(), cwd: None, env: Vec::new(), source: None }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Per-source crash counter.
///
/// A run shorter than the crash threshold counts as a crash; five in a row
/// open the breaker. Any long-lived run closes it again.
#[derive(Debug, Default, Clone)]
pub struct CircuitBreaker {
    consecutive_crashes: u32,
}

impl CircuitBreaker {
    pub fn record_exit(&mut self, uptime: Duration, threshold: Duration) {
        if uptime < threshold {
            self.consecutive_crashes = self.consecutive_crashes.saturating_add(1);
        } else {
            self.consecutive_crashes = 0;
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_crashes >= CRASH_TRIP_COUNT
    }

    pub fn consecutive_crashes(&self) -> u32 {
        self.consecutive_crashes
    }
}

struct Tracked {
    pid: u32,
    exited_rx: watch::Receiver<bool>,
}

/// Spawns and tracks backend child processes for the launcher.
pub struct ProcessSupervisor {
    procs: Mutex<HashMap<String, Tracked>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    event_tx: broadcast::Sender<ProcessEvent>,
    crash_threshold: Duration,
    kill_grace: Duration,
    /// Prepended to breaker source tags so multiple launchers in one
    /// process keep separate crash histories.
    source_prefix: String,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            procs: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            event_tx,
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
            kill_grace: DEFAULT_KILL_GRACE,
            source_prefix: String::new(),
        }
    }

    pub fn with_crash_threshold(mut self, threshold: Duration) -> Self {
        self.crash_threshold = threshold;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.source_prefix = prefix.into();
        self
    }

    /// Subscribe to spawn/exit/stdio events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.event_tx.subscribe()
    }

    fn source_tag(&self, opts: &SpawnOptions) -> String {
        let base = opts.source.clone().unwrap_or_else(|| opts.command.clone());
        if self.source_prefix.is_empty() {
            base
        } else {
            format!("{}:{base}", self.source_prefix)
        }
    }

    /// Spawn a child for `session_id`. Refused while the source's breaker
    /// is open or while the session already has a live process.
    pub async fn spawn_process(
        self: &Arc<Self>,
        session_id: &str,
        opts: SpawnOptions,
    ) -> Result<u32> {
        let source = self.source_tag(&opts);
        {
            let breakers = self.breakers.lock().await;
            if breakers.get(&source).is_some_and(CircuitBreaker::is_open) {
                return Err(Error::Process(format!(
                    "refusing to spawn {source}: circuit breaker open"
                )));
            }
        }
        {
            let procs = self.procs.lock().await;
            if procs.contains_key(session_id) {
                return Err(Error::Process(format!(
                    "session {session_id} already has a live process"
                )));
            }
        }

        let mut command = Command::new(&opts.command);
        command.args(&opts.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(ref cwd) = opts.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            command.env(key, value);
        }
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::Process(format!("spawn {} failed: {e}", opts.command))
        })?;
        let pid = child.id().ok_or_else(|| {
            Error::Process(format!("spawn {}: child exited before pid read", opts.command))
        })?;

        let spawned_at = Instant::now();
        let (exited_tx, exited_rx) = watch::channel(false);

        if let Some(stdout) = child.stdout.take() {
            spawn_stream_pump(stdout, session_id.to_owned(), self.event_tx.clone(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stream_pump(stderr, session_id.to_owned(), self.event_tx.clone(), true);
        }

        self.procs
            .lock()
            .await
            .insert(session_id.to_owned(), Tracked { pid, exited_rx });

        let _ = self.event_tx.send(ProcessEvent::Spawned {
            session_id: session_id.to_owned(),
            pid,
        });

        // Exit watcher: emits Exited exactly once, feeds the breaker, and
        // drops the tracking entry.
        let supervisor = Arc::clone(self);
        let session = session_id.to_owned();
        tokio::spawn(async move {
            let status = child.wait().await;
            let uptime = spawned_at.elapsed();
            let exit_code = status.ok().and_then(|s| s.code());

            {
                let mut breakers = supervisor.breakers.lock().await;
                breakers
                    .entry(source.clone())
                    .or_default()
                    .record_exit(uptime, supervisor.crash_threshold);
            }
            supervisor.procs.lock().await.remove(&session);
            let _ = exited_tx.send(true);
            let _ = supervisor.event_tx.send(ProcessEvent::Exited {
                session_id: session,
                exit_code,
                uptime_ms: uptime.as_millis() as u64,
            });
        });

        Ok(pid)
    }

    /// SIGTERM the session's process, escalating to SIGKILL after the
    /// grace period. Returns `false` when no process is tracked.
    pub async fn kill_process(&self, session_id: &str) -> bool {
        let (pid, mut exited_rx) = {
            let procs = self.procs.lock().await;
            match procs.get(session_id) {
                Some(t) => (t.pid, t.exited_rx.clone()),
                None => return false,
            }
        };

        signal_pid(pid, Signal::SIGTERM);
        let wait_exit = async {
            while !*exited_rx.borrow() {
                if exited_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = wait_exit => {}
            _ = tokio::time::sleep(self.kill_grace) => {
                debug!(session_id, pid, "kill grace expired, sending SIGKILL");
                signal_pid(pid, Signal::SIGKILL);
            }
        }
        true
    }

    /// Kill every tracked process.
    pub async fn kill_all(&self) {
        let sessions: Vec<String> = self.procs.lock().await.keys().cloned().collect();
        for session_id in sessions {
            self.kill_process(&session_id).await;
        }
    }

    /// PID of the session's live process, if any.
    pub async fn pid_of(&self, session_id: &str) -> Option<u32> {
        self.procs.lock().await.get(session_id).map(|t| t.pid)
    }

    /// Breaker snapshot for a source tag (tests, status API).
    pub async fn breaker_state(&self, source: &str) -> CircuitBreaker {
        self.breakers.lock().await.get(source).cloned().unwrap_or_default()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_stream_pump<R>(
    mut reader: R,
    session_id: String,
    event_tx: broadcast::Sender<ProcessEvent>,
    is_stderr: bool,
) where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if chunk.trim().is_empty() {
                        continue;
                    }
                    let event = if is_stderr {
                        ProcessEvent::Stderr { session_id: session_id.clone(), chunk }
                    } else {
                        ProcessEvent::Stdout { session_id: session_id.clone(), chunk }
                    };
                    let _ = event_tx.send(event);
                }
                // Stream errors are not fatal to the session.
                Err(e) => {
                    warn!(session_id, err = %e, "stdio pump read error");
                    break;
                }
            }
        }
    });
}

/// Deliver a signal to a PID, ignoring delivery failures (already exited).
pub fn signal_pid(pid: u32, signal: Signal) {
    if let Ok(pid_i32) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid_i32), signal);
    }
}

/// Checks whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// What the launcher needs to (re)start a session's backend process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub options: SpawnOptions,
}

#[derive(Debug, Clone)]
struct LaunchState {
    spec: LaunchSpec,
    connected: bool,
}

/// Tracks which sessions have a registered backend process and whether it
/// has connected back yet. The reconnect watchdog polls
/// [`starting_sessions`] and calls [`relaunch`] on expiry.
pub struct ProcessLauncher {
    supervisor: Arc<ProcessSupervisor>,
    sessions: Mutex<HashMap<String, LaunchState>>,
}

impl ProcessLauncher {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Register a session's launch spec without spawning yet.
    pub async fn register(&self, session_id: &str, spec: LaunchSpec) {
        self.sessions
            .lock()
            .await
            .insert(session_id.to_owned(), LaunchState { spec, connected: false });
    }

    /// Spawn (or respawn) the session's backend process.
    pub async fn launch(&self, session_id: &str) -> Result<u32> {
        let spec = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .map(|s| s.spec.clone())
                .ok_or_else(|| Error::Process(format!("no launch spec for {session_id}")))?
        };
        self.supervisor.spawn_process(session_id, spec.options).await
    }

    /// Sessions that are registered but have no connected backend.
    pub async fn starting_sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, s)| !s.connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Mark the session's backend as connected (clears it from the
    /// watchdog's view).
    pub async fn mark_connected(&self, session_id: &str) {
        if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
            state.connected = true;
        }
    }

    /// Mark the session's backend as gone so the watchdog re-arms.
    pub async fn mark_disconnected(&self, session_id: &str) {
        if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
            state.connected = false;
        }
    }

    /// Kill and respawn the session's process.
    pub async fn relaunch(&self, session_id: &str) -> Result<u32> {
        self.supervisor.kill_process(session_id).await;
        self.launch(session_id).await
    }

    /// Forget a session entirely (delete path).
    pub async fn remove(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
        self.supervisor.kill_process(session_id).await;
    }

    /// Kill all processes and forget all sessions.
    pub async fn stop_all(&self) {
        self.sessions.lock().await.clear();
        self.supervisor.kill_all().await;
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
