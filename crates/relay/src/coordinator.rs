// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level facade wiring the bridge, launcher, storage, and watchdogs.
//!
//! No business logic lives here; the coordinator resolves adapters,
//! owns lifecycle (start/stop/restore), and reacts to bus events that
//! cross component boundaries (relaunch, persistence, process logs).

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Map;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterResolver, ConnectOptions};
use crate::bridge::{SessionBridge, SessionSeed};
use crate::error::{Error, Result};
use crate::events::{DomainEvent, EventBus};
use crate::policy::{IdleReaper, ReconnectWatchdog, WatchdogConfig};
use crate::storage::{ProcessLogService, SessionRecord, SessionStore};
use crate::supervisor::{ProcessEvent, ProcessLauncher};

/// Options for [`SessionCoordinator::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub adapter_name: Option<String>,
}

/// Wires everything together and owns the process lifecycle.
pub struct SessionCoordinator {
    bridge: Arc<SessionBridge>,
    resolver: Arc<AdapterResolver>,
    launcher: Option<Arc<ProcessLauncher>>,
    store: Option<Arc<SessionStore>>,
    logs: Arc<ProcessLogService>,
    bus: EventBus,
    watchdog_config: WatchdogConfig,
    shutdown: CancellationToken,
    /// Relaunch dedup: sessions with a reconnect already in flight.
    relaunching: Mutex<HashSet<String>>,
}

impl SessionCoordinator {
    pub fn new(
        bridge: Arc<SessionBridge>,
        resolver: Arc<AdapterResolver>,
        launcher: Option<Arc<ProcessLauncher>>,
        store: Option<Arc<SessionStore>>,
        watchdog_config: WatchdogConfig,
    ) -> Arc<Self> {
        let bus = bridge.bus().clone();
        Arc::new(Self {
            bridge,
            resolver,
            launcher,
            store,
            logs: Arc::new(ProcessLogService::default()),
            bus,
            watchdog_config,
            shutdown: CancellationToken::new(),
            relaunching: Mutex::new(HashSet::new()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn bridge(&self) -> &Arc<SessionBridge> {
        &self.bridge
    }

    pub fn logs(&self) -> &Arc<ProcessLogService> {
        &self.logs
    }

    /// Create a new session and connect (or launch) its backend.
    pub async fn create_session(&self, options: CreateSessionOptions) -> Result<String> {
        let adapter_name = match options.adapter_name.clone() {
            Some(name) => name,
            None => {
                let mut names = self.resolver.registered_names();
                if names.len() == 1 {
                    names.remove(0)
                } else {
                    return Err(Error::NoAdapter(
                        "no adapter named and none is an unambiguous default".to_owned(),
                    ));
                }
            }
        };
        let adapter = self.resolver.resolve(&adapter_name)?;
        let session_id = uuid::Uuid::new_v4().to_string();

        let seed = SessionSeed {
            cwd: options.cwd.clone(),
            model: options.model.clone(),
            adapter_name: Some(adapter_name.clone()),
            backend_session_id: None,
            name: None,
        };

        if adapter.inverted() {
            // The backend process dials back in; we only seed state and
            // hand the spawn to the launcher.
            let launcher = self
                .launcher
                .as_ref()
                .ok_or_else(|| Error::Process("inverted adapter needs a launcher".to_owned()))?;
            let mut connect = ConnectOptions::new(session_id.clone());
            if let Some(cwd) = &options.cwd {
                connect = connect.with_option("cwd", serde_json::json!(cwd));
            }
            let spec = adapter.launch_spec(&connect).ok_or_else(|| {
                Error::Process(format!("adapter {adapter_name} provided no launch spec"))
            })?;
            self.bridge.create_session(&session_id, seed).await;
            launcher.register(&session_id, spec).await;
            if let Err(e) = launcher.launch(&session_id).await {
                self.rollback_session(&session_id).await;
                return Err(e);
            }
        } else {
            self.bridge.create_session(&session_id, seed).await;
            let mut adapter_options = Map::new();
            if let Some(cwd) = &options.cwd {
                adapter_options.insert("cwd".to_owned(), serde_json::json!(cwd));
            }
            if let Err(e) = self.bridge.connect_backend(&session_id, adapter_options).await {
                self.rollback_session(&session_id).await;
                return Err(e);
            }
        }

        self.persist(&session_id, &options).await;
        info!(session_id, adapter = adapter_name, "session created");
        Ok(session_id)
    }

    async fn rollback_session(&self, session_id: &str) {
        if let Some(runtime) = self.bridge.remove(session_id).await {
            runtime.close().await;
        }
    }

    async fn persist(&self, session_id: &str, options: &CreateSessionOptions) {
        let Some(store) = &self.store else { return };
        let mut record = SessionRecord::new(session_id);
        record.cwd = options.cwd.clone();
        record.model = options.model.clone();
        record.adapter_name = options.adapter_name.clone().or_else(|| {
            let names = self.resolver.registered_names();
            (names.len() == 1).then(|| names[0].clone())
        });
        if let Err(e) = store.save(&record) {
            warn!(session_id, err = %e, "failed to persist session record");
        }
    }

    /// Delete a session: process, sockets, registry entry, stored record.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        if let Some(launcher) = &self.launcher {
            launcher.remove(session_id).await;
        }
        self.relaunching.lock().await.remove(session_id);
        let runtime = self
            .bridge
            .remove(session_id)
            .await
            .ok_or_else(|| Error::Connection(format!("unknown session {session_id}")))?;
        runtime.close().await;
        if let Some(store) = &self.store {
            store.delete(session_id)?;
        }
        Ok(())
    }

    /// Start: restore persisted sessions, wire event reactions, spawn
    /// watchdogs. The WebSocket transport is started by the daemon shell
    /// around this coordinator.
    pub async fn start(self: &Arc<Self>) {
        self.restore().await;
        self.spawn_event_loop();
        self.spawn_process_event_loop();

        if let Some(launcher) = &self.launcher {
            let watchdog = ReconnectWatchdog::new(
                Arc::clone(&self.bridge),
                Arc::clone(launcher) as Arc<dyn crate::policy::RelaunchTarget>,
                self.watchdog_config.clone(),
            );
            tokio::spawn(watchdog.run(self.shutdown.clone()));
        }
        let reaper = IdleReaper::new(Arc::clone(&self.bridge), self.watchdog_config.clone());
        tokio::spawn(reaper.run(self.shutdown.clone()));
        info!("coordinator started");
    }

    /// Seed sessions from storage. Launcher registration happens first so
    /// process handles exist before the bridge seeds state; consumers that
    /// join before backend reconnect still see cwd/model/adapter.
    async fn restore(&self) {
        let Some(store) = &self.store else { return };
        for record in store.load_all() {
            debug!(session_id = %record.session_id, "restoring session");
            if let (Some(launcher), Some(adapter_name)) =
                (&self.launcher, record.adapter_name.as_deref())
            {
                if let Ok(adapter) = self.resolver.resolve(adapter_name) {
                    if adapter.inverted() {
                        let mut connect = ConnectOptions::new(record.session_id.clone());
                        if let Some(cwd) = &record.cwd {
                            connect = connect.with_option("cwd", serde_json::json!(cwd));
                        }
                        if let Some(spec) = adapter.launch_spec(&connect) {
                            launcher.register(&record.session_id, spec).await;
                        }
                    }
                }
            }
            self.bridge
                .create_session(
                    &record.session_id,
                    SessionSeed {
                        cwd: record.cwd.clone(),
                        model: record.model.clone(),
                        adapter_name: record.adapter_name.clone(),
                        backend_session_id: record.backend_session_id.clone(),
                        name: record.name.clone(),
                    },
                )
                .await;
        }
    }

    /// React to domain events that cross component boundaries.
    fn spawn_event_loop(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut events = self.bus.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                let Ok(event) = event else { continue };
                match event {
                    DomainEvent::BackendConnected { session_id } => {
                        if let Some(launcher) = &coordinator.launcher {
                            launcher.mark_connected(&session_id).await;
                        }
                        coordinator.relaunching.lock().await.remove(&session_id);
                    }
                    DomainEvent::BackendDisconnected { session_id } => {
                        if let Some(launcher) = &coordinator.launcher {
                            launcher.mark_disconnected(&session_id).await;
                        }
                    }
                    DomainEvent::BackendSessionId { session_id, backend_session_id } => {
                        coordinator.update_record(&session_id, |record| {
                            record.backend_session_id = Some(backend_session_id.clone());
                        });
                    }
                    DomainEvent::FirstTurnCompleted { session_id } => {
                        let name = match coordinator.bridge.get(&session_id).await {
                            Some(runtime) => runtime.with_state(|s| s.name.clone()).await,
                            None => None,
                        };
                        if let Some(name) = name {
                            coordinator.update_record(&session_id, |record| {
                                record.name = Some(name.clone());
                            });
                        }
                    }
                    DomainEvent::BackendRelaunchNeeded { session_id } => {
                        coordinator.handle_relaunch_needed(session_id).await;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Feed supervisor events into the process log and the bus.
    fn spawn_process_event_loop(self: &Arc<Self>) {
        let Some(launcher) = &self.launcher else { return };
        let mut events = launcher.supervisor().subscribe();
        let coordinator = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                let Ok(event) = event else { continue };
                match event {
                    ProcessEvent::Stdout { session_id, chunk }
                    | ProcessEvent::Stderr { session_id, chunk } => {
                        coordinator.logs.append(&session_id, &chunk);
                    }
                    ProcessEvent::Exited { session_id, exit_code, uptime_ms } => {
                        debug!(session_id, ?exit_code, uptime_ms, "backend process exited");
                        if let Some(launcher) = &coordinator.launcher {
                            launcher.mark_disconnected(&session_id).await;
                        }
                    }
                    ProcessEvent::Spawned { session_id, pid } => {
                        debug!(session_id, pid, "backend process spawned");
                    }
                }
            }
        });
    }

    /// A consumer joined a session whose backend is detached: reconnect,
    /// deduplicating concurrent attempts.
    async fn handle_relaunch_needed(self: &Arc<Self>, session_id: String) {
        {
            let mut relaunching = self.relaunching.lock().await;
            if !relaunching.insert(session_id.clone()) {
                return;
            }
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator
                .bridge
                .connect_backend(&session_id, Map::new())
                .await;
            if let Err(e) = result {
                warn!(session_id, err = %e, "relaunch failed");
                coordinator.bus.emit(DomainEvent::Error {
                    source: "coordinator".to_owned(),
                    error: e.to_string(),
                    session_id: Some(session_id.clone()),
                });
                coordinator.relaunching.lock().await.remove(&session_id);
            }
        });
    }

    fn update_record(&self, session_id: &str, mutate: impl Fn(&mut SessionRecord)) {
        let Some(store) = &self.store else { return };
        let mut record = match store.load(session_id) {
            Ok(record) => record,
            Err(_) => SessionRecord::new(session_id),
        };
        mutate(&mut record);
        if let Err(e) = store.save(&record) {
            warn!(session_id, err = %e, "failed to update session record");
        }
    }

    /// Stop everything: watchdogs, processes, sessions, adapters.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.bridge.close_all().await;
        if let Some(launcher) = &self.launcher {
            launcher.stop_all().await;
        }
        self.resolver.stop_all().await;
        info!("coordinator stopped");
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
