// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::bridge::BridgeConfig;
use crate::policy::WatchdogConfig;

/// Multi-backend gateway for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
pub struct Config {
    /// Host address to bind the consumer WebSocket server to.
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Consumer WebSocket port (0 = random).
    #[arg(long, env = "RELAY_PORT", default_value = "8790")]
    pub port: u16,

    /// Data directory for session records, the daemon lock, and daemon.json.
    #[arg(long, env = "RELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Shared consumer token. Unset = open access.
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Comma-separated Origin allowlist. Unset = any origin.
    #[arg(long, env = "RELAY_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Option<Vec<String>>,

    /// Default adapter for new sessions (acp, codex, opencode).
    #[arg(long, env = "RELAY_ADAPTER")]
    pub adapter: Option<String>,

    /// Command for the ACP-family agent, e.g. "claude-code-acp".
    #[arg(long, env = "RELAY_ACP_COMMAND")]
    pub acp_command: Option<String>,

    /// WebSocket URL of the codex-family app-server.
    #[arg(long, env = "RELAY_CODEX_URL")]
    pub codex_url: Option<String>,

    /// Command the launcher runs to start the codex app-server. When set,
    /// relay owns the app-server process; it must listen at --codex-url.
    #[arg(long, env = "RELAY_CODEX_LAUNCH_COMMAND")]
    pub codex_launch_command: Option<String>,

    /// Base URL of a running opencode-family server.
    #[arg(long, env = "RELAY_OPENCODE_URL")]
    pub opencode_url: Option<String>,

    /// Directory scope for the opencode-family adapter.
    #[arg(long, env = "RELAY_OPENCODE_DIR", default_value = ".")]
    pub opencode_dir: String,

    /// Replay history ring capacity (frames per session).
    #[arg(long, env = "RELAY_HISTORY_CAP", default_value = "500")]
    pub history_cap: usize,

    /// Inbound consumer frame cap in bytes.
    #[arg(long, env = "RELAY_MAX_FRAME", default_value = "262144")]
    pub max_frame_bytes: usize,

    /// Per-socket rate limit burst size.
    #[arg(long, env = "RELAY_RATE_BURST", default_value = "30")]
    pub rate_burst: u32,

    /// Per-socket rate limit refill per second.
    #[arg(long, env = "RELAY_RATE_REFILL", default_value = "3.0")]
    pub rate_refill: f64,

    /// Seconds before a starting backend is declared lost and relaunched.
    #[arg(long, env = "RELAY_RECONNECT_GRACE", default_value = "30")]
    pub reconnect_grace_secs: u64,

    /// Seconds an idle, consumer-less session survives before reaping.
    #[arg(long, env = "RELAY_IDLE_TIMEOUT", default_value = "1800")]
    pub idle_timeout_secs: u64,

    /// Watchdog poll interval in seconds.
    #[arg(long, env = "RELAY_POLL_INTERVAL", default_value = "5")]
    pub poll_interval_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate cross-field constraints before starting anything.
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.log_format.as_str(), "json" | "text") {
            return Err(format!("invalid log format {:?} (json|text)", self.log_format));
        }
        if !matches!(self.log_level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(format!("invalid log level {:?}", self.log_level));
        }
        if self.history_cap == 0 {
            return Err("history cap must be at least 1".to_owned());
        }
        if self.max_frame_bytes < 1024 {
            return Err("max frame must be at least 1024 bytes".to_owned());
        }
        if self.rate_refill <= 0.0 || !self.rate_refill.is_finite() {
            return Err("rate refill must be a positive number".to_owned());
        }
        if self.codex_launch_command.is_some() && self.codex_url.is_none() {
            return Err("--codex-launch-command requires --codex-url".to_owned());
        }
        if let Some(adapter) = &self.adapter {
            match adapter.as_str() {
                "acp" if self.acp_command.is_none() => {
                    return Err("--adapter acp requires --acp-command".to_owned());
                }
                "codex" if self.codex_url.is_none() => {
                    return Err("--adapter codex requires --codex-url".to_owned());
                }
                "opencode" if self.opencode_url.is_none() => {
                    return Err("--adapter opencode requires --opencode-url".to_owned());
                }
                "acp" | "codex" | "opencode" => {}
                other => return Err(format!("unknown adapter {other:?}")),
            }
        }
        Ok(())
    }

    /// Resolved data directory (defaults under `$XDG_STATE_HOME`).
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_default();
            format!("{home}/.local/state")
        });
        PathBuf::from(state_home).join("relay")
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            max_frame_bytes: self.max_frame_bytes,
            history_cap: self.history_cap,
            rate_capacity: self.rate_burst,
            rate_refill_per_sec: self.rate_refill,
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            reconnect_grace: Duration::from_secs(self.reconnect_grace_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
