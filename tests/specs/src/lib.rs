// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `relay` binary as a subprocess and exercises it over
//! the control API and the consumer WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Resolve the path to the compiled `relay` binary.
pub fn relay_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("relay")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Control API coordinates parsed from the daemon's `daemon.json`.
#[derive(Debug, Clone)]
pub struct ControlInfo {
    pub port: u16,
    pub token: String,
}

/// A running `relay` daemon, killed on drop.
pub struct RelayProcess {
    child: Child,
    port: u16,
    data_dir: tempfile::TempDir,
}

impl RelayProcess {
    /// Spawn relay on a free port with an isolated data directory.
    pub fn start(extra_args: &[&str]) -> anyhow::Result<Self> {
        let binary = relay_binary();
        anyhow::ensure!(binary.exists(), "relay binary not found at {}", binary.display());

        let data_dir = tempfile::tempdir()?;
        let port = free_port()?;

        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--data-dir".into(),
            data_dir.path().to_string_lossy().into_owned(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        args.extend(extra_args.iter().map(|s| (*s).to_owned()));

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, data_dir })
    }

    /// Spawn a second daemon against an existing data directory.
    pub fn start_in(data_dir: &Path) -> anyhow::Result<Child> {
        let binary = relay_binary();
        let port = free_port()?;
        Ok(Command::new(&binary)
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--data-dir",
                &data_dir.to_string_lossy(),
                "--log-level",
                "error",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?)
    }

    /// The consumer WebSocket port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    /// Wait for `daemon.json` to appear, returning the control info.
    pub fn wait_for_control(&self, timeout: Duration) -> anyhow::Result<ControlInfo> {
        let path = self.data_dir.path().join("daemon.json");
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(data) = std::fs::read(&path) {
                if let Ok(info) = serde_json::from_slice::<serde_json::Value>(&data) {
                    let port = info["control_port"].as_u64().unwrap_or_default() as u16;
                    let token = info["token"].as_str().unwrap_or_default().to_owned();
                    if port != 0 && !token.is_empty() {
                        return Ok(ControlInfo { port, token });
                    }
                }
            }
            anyhow::ensure!(Instant::now() < deadline, "daemon.json never appeared");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
