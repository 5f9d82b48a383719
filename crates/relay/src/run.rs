// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon assembly: build every component from [`Config`] and run until
//! interrupted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::acp::AcpAdapter;
use crate::adapter::codex::CodexAdapter;
use crate::adapter::opencode::OpencodeAdapter;
use crate::adapter::{AdapterResolver, BackendAdapter};
use crate::bridge::{Authenticator, OpenAccess, SessionBridge, TokenAuthenticator};
use crate::config::Config;
use crate::coordinator::SessionCoordinator;
use crate::daemon::{start_control_api, DaemonLock};
use crate::events::EventBus;
use crate::server::{serve, GatewayState};
use crate::storage::SessionStore;
use crate::supervisor::{ProcessLauncher, ProcessSupervisor};

/// Initialize the tracing subscriber from the log knobs.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Register the adapter families the config enables.
pub fn build_resolver(config: &Config) -> Arc<AdapterResolver> {
    let resolver = AdapterResolver::new();
    if let Some(command) = &config.acp_command {
        let command: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
        resolver.register("acp", move || {
            Arc::new(AcpAdapter::new(command.clone())) as Arc<dyn BackendAdapter>
        });
    }
    if let Some(url) = &config.codex_url {
        let url = url.clone();
        let launch = config.codex_launch_command.clone();
        resolver.register("codex", move || {
            let mut adapter = CodexAdapter::new().with_app_server_url(url.clone());
            if let Some(command) = &launch {
                let command: Vec<String> =
                    command.split_whitespace().map(str::to_owned).collect();
                adapter = adapter.with_app_server_launch(command);
            }
            Arc::new(adapter) as Arc<dyn BackendAdapter>
        });
    }
    if let Some(url) = &config.opencode_url {
        let url = url.clone();
        let directory = config.opencode_dir.clone();
        resolver.register("opencode", move || {
            Arc::new(OpencodeAdapter::new(url.clone(), directory.clone()))
                as Arc<dyn BackendAdapter>
        });
    }
    Arc::new(resolver)
}

/// Run the gateway until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let _lock = DaemonLock::acquire(&data_dir)?;

    let store = Arc::new(SessionStore::new(&data_dir)?);
    let resolver = build_resolver(&config);
    let authenticator: Arc<dyn Authenticator> = match &config.auth_token {
        Some(token) => Arc::new(TokenAuthenticator::new(token.clone())),
        None => Arc::new(OpenAccess),
    };
    let bridge = SessionBridge::new(
        Arc::clone(&resolver),
        authenticator,
        EventBus::new(),
        config.bridge_config(),
    );
    let supervisor = Arc::new(ProcessSupervisor::new());
    let launcher = Arc::new(ProcessLauncher::new(supervisor));

    let coordinator = SessionCoordinator::new(
        Arc::clone(&bridge),
        resolver,
        Some(launcher),
        Some(store),
        config.watchdog_config(),
    );
    coordinator.start().await;

    let shutdown = CancellationToken::new();
    let state = Arc::new(GatewayState {
        bridge: Arc::clone(&bridge),
        allowed_origins: config.allowed_origins.clone(),
    });
    let addr = serve(state, &format!("{}:{}", config.host, config.port), shutdown.clone()).await?;
    let (control_port, _token) =
        start_control_api(Arc::clone(&coordinator), &data_dir, shutdown.clone()).await?;
    info!(ws = %addr, control = control_port, "relay is up");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    coordinator.stop().await;
    Ok(())
}
