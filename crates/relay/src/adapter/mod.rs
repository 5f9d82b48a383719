// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend adapter contract.
//!
//! Every agent family implements [`BackendAdapter`] (connect sessions) and
//! [`BackendSession`] (one live conversation). Adapters translate their
//! wire format to and from [`UnifiedMessage`] in both directions; nothing
//! family-specific leaks past this seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{Role, UnifiedMessage, UnifiedType};

pub mod acp;
pub mod codex;
pub mod inproc;
pub mod opencode;

/// Where an adapter's backend can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Local,
    Remote,
    Both,
}

/// What an adapter family can do. Checked via flags, not subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    pub slash_commands: bool,
    pub availability: Availability,
    pub teams: bool,
}

/// Options for [`BackendAdapter::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub session_id: String,
    /// Backend-internal session id to resume after a restart.
    pub resume: Option<String>,
    /// Family-specific knobs (urls, commands, directories).
    pub adapter_options: Map<String, Value>,
}

impl ConnectOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), resume: None, adapter_options: Map::new() }
    }

    pub fn with_resume(mut self, backend_session_id: impl Into<String>) -> Self {
        self.resume = Some(backend_session_id.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.adapter_options.insert(key.into(), value);
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.adapter_options.get(key).and_then(|v| v.as_str())
    }
}

/// Native slash-command execution offered by some adapters.
#[async_trait]
pub trait SlashExecutor: Send + Sync {
    fn handles(&self, command: &str) -> bool;
    async fn execute(&self, session_id: &str, command: &str) -> Result<String>;
}

/// A family of agents reachable through one wire protocol.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier (`acp`, `codex`, `opencode`, ...).
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Open (or resume) one backend conversation.
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BackendSession>>;

    /// Native slash-command executor, when the family has one.
    fn slash_executor(&self) -> Option<Arc<dyn SlashExecutor>> {
        None
    }

    /// Inverted adapters spawn a process that dials back into the gateway
    /// rather than being connected to.
    fn inverted(&self) -> bool {
        false
    }

    /// For inverted adapters: what the launcher should spawn for a session.
    fn launch_spec(&self, _options: &ConnectOptions) -> Option<crate::supervisor::LaunchSpec> {
        None
    }

    /// Adapter-wide cleanup (shared transports, spawned servers).
    async fn stop(&self) {}
}

/// One live backend conversation.
///
/// The message stream has at most one consumer: [`take_messages`] hands the
/// receiver out once. `close` ends the stream; subsequent sends fail with
/// [`Error::SessionClosed`].
///
/// [`take_messages`]: BackendSession::take_messages
#[async_trait]
pub trait BackendSession: Send + Sync {
    fn session_id(&self) -> &str;

    /// Translate a unified message into the family wire format and send it.
    /// Dispatches on `message.kind`: `user_message`, `interrupt`,
    /// `permission_response`, `configuration_change`.
    async fn send(&self, message: UnifiedMessage) -> Result<()>;

    /// Escape hatch for protocols needing verbatim wire bytes.
    async fn send_raw(&self, _line: &str) -> Result<()> {
        Err(Error::Protocol("raw send not supported by this adapter".to_owned()))
    }

    /// Take the inbound message stream. Yields `None` after the first call.
    fn take_messages(&self) -> Option<mpsc::Receiver<UnifiedMessage>>;

    /// Idempotent: terminates the stream and releases the transport.
    async fn close(&self);

    /// Interrupt the current turn. Default delegates to [`send`] with an
    /// `interrupt` message.
    ///
    /// [`send`]: BackendSession::send
    async fn interrupt(&self) -> Result<()> {
        self.send(UnifiedMessage::new(UnifiedType::Interrupt, Role::User)).await
    }
}

type AdapterFactory = Box<dyn Fn() -> Arc<dyn BackendAdapter> + Send + Sync>;

/// Name → adapter registry with a singleton cache.
///
/// Adapters hold shared transports (one SSE connection, one spawned app
/// server), so `resolve` must hand back the same instance every time.
pub struct AdapterResolver {
    factories: parking_lot::Mutex<HashMap<String, AdapterFactory>>,
    cache: parking_lot::Mutex<HashMap<String, Arc<dyn BackendAdapter>>>,
}

impl AdapterResolver {
    pub fn new() -> Self {
        Self {
            factories: parking_lot::Mutex::new(HashMap::new()),
            cache: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn BackendAdapter> + Send + Sync + 'static,
    {
        self.factories.lock().insert(name.into(), Box::new(factory));
    }

    /// Register an already-built adapter instance.
    pub fn register_instance(&self, adapter: Arc<dyn BackendAdapter>) {
        self.cache.lock().insert(adapter.name().to_owned(), adapter);
    }

    /// Resolve by name, constructing at most once per name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        if let Some(adapter) = self.cache.lock().get(name) {
            return Ok(Arc::clone(adapter));
        }
        let factory_result = {
            let factories = self.factories.lock();
            factories.get(name).map(|f| f())
        };
        match factory_result {
            Some(adapter) => {
                self.cache.lock().insert(name.to_owned(), Arc::clone(&adapter));
                Ok(adapter)
            }
            None => Err(Error::NoAdapter(name.to_owned())),
        }
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .lock()
            .keys()
            .chain(self.cache.lock().keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Stop every constructed adapter and drop the cache.
    pub async fn stop_all(&self) {
        let adapters: Vec<Arc<dyn BackendAdapter>> = {
            let mut cache = self.cache.lock();
            cache.drain().map(|(_, a)| a).collect()
        };
        for adapter in adapters {
            adapter.stop().await;
        }
    }
}

impl Default for AdapterResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "compliance.rs"]
pub mod compliance;

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;
