// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session metadata persistence and the in-memory process log.
//!
//! One JSON file per session under the data directory. Conversation
//! content is never persisted; only enough metadata to restore and resume
//! sessions across a daemon restart.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::now_epoch_ms;
use crate::trace::redact;

/// Persisted per-session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: u64,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: None,
            model: None,
            adapter_name: None,
            backend_session_id: None,
            name: None,
            created_at: now_epoch_ms(),
        }
    }
}

/// File-per-session store rooted at the data directory.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.path_for(&record.session_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.session_id));
        let data = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, data)
            .map_err(|e| Error::Storage(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::Storage(format!("rename to {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<SessionRecord> {
        let path = self.path_for(session_id);
        let data = std::fs::read(&path)
            .map_err(|e| Error::Storage(format!("read {}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("remove {}: {e}", path.display()))),
        }
    }

    /// Load every parseable record. Corrupt files are logged and skipped,
    /// never fatal to startup.
    pub fn load_all(&self) -> Vec<SessionRecord> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), err = %e, "cannot enumerate session store");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.') || n == "daemon.json")
            {
                continue;
            }
            match std::fs::read(&path).map_err(Error::from).and_then(|data| {
                serde_json::from_slice::<SessionRecord>(&data).map_err(Error::from)
            }) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "skipping unreadable session record");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Default cap on retained log lines per session.
pub const DEFAULT_LOG_CAP: usize = 200;

/// Bounded in-memory ring of redacted backend stdout/stderr lines.
///
/// Memory only; process logs never reach disk.
pub struct ProcessLogService {
    rings: Mutex<HashMap<String, VecDeque<String>>>,
    cap: usize,
}

impl ProcessLogService {
    pub fn new(cap: usize) -> Self {
        Self { rings: Mutex::new(HashMap::new()), cap }
    }

    /// Append one chunk of process output, redacted line by line.
    pub fn append(&self, session_id: &str, chunk: &str) {
        let mut rings = self.rings.lock();
        let ring = rings.entry(session_id.to_owned()).or_default();
        for line in chunk.lines() {
            if line.trim().is_empty() {
                continue;
            }
            ring.push_back(redact(line));
            while ring.len() > self.cap {
                ring.pop_front();
            }
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Vec<String> {
        self.rings
            .lock()
            .get(session_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.rings.lock().remove(session_id);
    }
}

impl Default for ProcessLogService {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAP)
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
