// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watchdog policies: reconnect grace and idle reaping.
//!
//! Both are periodic cancellation-token loops that only observe and then
//! apply policy commands to runtimes; they hold no session state of their
//! own beyond their timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::SessionBridge;
use crate::error::Result;
use crate::session::runtime::PolicyCommand;
use crate::supervisor::ProcessLauncher;

/// What the reconnect watchdog needs from a launcher.
#[async_trait]
pub trait RelaunchTarget: Send + Sync {
    /// Sessions whose backend process is expected but not yet connected.
    async fn starting_sessions(&self) -> Vec<String>;

    /// Kill and respawn the session's backend process.
    async fn relaunch(&self, session_id: &str) -> Result<()>;
}

#[async_trait]
impl RelaunchTarget for ProcessLauncher {
    async fn starting_sessions(&self) -> Vec<String> {
        ProcessLauncher::starting_sessions(self).await
    }

    async fn relaunch(&self, session_id: &str) -> Result<()> {
        ProcessLauncher::relaunch(self, session_id).await.map(|_| ())
    }
}

/// Timing knobs for both watchdogs.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub reconnect_grace: Duration,
    pub idle_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reconnect_grace: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Watches sessions stuck in `starting` and forces a relaunch after the
/// grace period, degrading the session first.
pub struct ReconnectWatchdog {
    bridge: Arc<SessionBridge>,
    launcher: Arc<dyn RelaunchTarget>,
    config: WatchdogConfig,
}

impl ReconnectWatchdog {
    pub fn new(
        bridge: Arc<SessionBridge>,
        launcher: Arc<dyn RelaunchTarget>,
        config: WatchdogConfig,
    ) -> Self {
        Self { bridge, launcher, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("reconnect watchdog started");
        let mut deadlines: HashMap<String, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("reconnect watchdog shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let starting = self.launcher.starting_sessions().await;

            // Sessions that connected since last poll lose their timer.
            deadlines.retain(|session_id, _| starting.contains(session_id));

            let now = Instant::now();
            for session_id in starting {
                let deadline = *deadlines
                    .entry(session_id.clone())
                    .or_insert_with(|| now + self.config.reconnect_grace);
                if now < deadline {
                    continue;
                }
                deadlines.remove(&session_id);
                warn!(session_id, "reconnect grace expired");
                if let Some(runtime) = self.bridge.get(&session_id).await {
                    runtime.apply_policy_command(PolicyCommand::ReconnectTimeout).await;
                }
                if let Err(e) = self.launcher.relaunch(&session_id).await {
                    warn!(session_id, err = %e, "relaunch failed");
                }
            }
        }
    }
}

/// Reaps sessions that have been idle with zero consumers for too long.
pub struct IdleReaper {
    bridge: Arc<SessionBridge>,
    config: WatchdogConfig,
}

impl IdleReaper {
    pub fn new(bridge: Arc<SessionBridge>, config: WatchdogConfig) -> Self {
        Self { bridge, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("idle reaper started");
        let mut idle_since: HashMap<String, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("idle reaper shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let candidates = self.bridge.idle_candidates().await;
            idle_since.retain(|session_id, _| candidates.contains(session_id));

            let now = Instant::now();
            for session_id in candidates {
                let since = *idle_since.entry(session_id.clone()).or_insert(now);
                if now.duration_since(since) < self.config.idle_timeout {
                    continue;
                }
                idle_since.remove(&session_id);
                info!(session_id, "reaping idle session");
                if let Some(runtime) = self.bridge.get(&session_id).await {
                    runtime.apply_policy_command(PolicyCommand::IdleReap).await;
                }
                self.bridge.remove(&session_id).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
