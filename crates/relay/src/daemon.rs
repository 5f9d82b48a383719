// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon shell: single-instance lock file and the loopback control API.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::{CreateSessionOptions, SessionCoordinator};
use crate::error::{Error, Result};
use crate::supervisor::is_process_alive;

/// Held while this process is the daemon; releases the lock on drop.
#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
}

impl DaemonLock {
    /// Acquire `<dir>/daemon.lock` via `O_CREAT|O_EXCL`, writing our PID.
    ///
    /// A stale lock (owner no longer alive) is reclaimed with unlink and
    /// one retry; losing that retry race means another daemon won.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join("daemon.lock");
        for attempt in 0..2 {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner: Option<u32> = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse().ok());
                    if owner.is_some_and(is_process_alive) {
                        return Err(Error::Process(format!(
                            "daemon already running (pid {})",
                            owner.unwrap_or_default()
                        )));
                    }
                    if attempt > 0 {
                        // Lost the reclaim race to another starter.
                        return Err(Error::Process("daemon already running".to_owned()));
                    }
                    warn!(path = %path.display(), "reclaiming stale daemon lock");
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => {
                    return Err(Error::Storage(format!("create {}: {e}", path.display())));
                }
            }
        }
        Err(Error::Process("daemon already running".to_owned()))
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Written to `<dir>/daemon.json` so local clients can find and talk to
/// the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub control_port: u16,
    pub token: String,
}

/// 32 random bytes as hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

struct ControlState {
    coordinator: Arc<SessionCoordinator>,
    token: String,
}

/// Require `Authorization: Bearer <token>` on every control request.
async fn auth_layer(
    State(state): State<Arc<ControlState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.token);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})))
            .into_response();
    }
    next.run(request).await
}

async fn health(State(_state): State<Arc<ControlState>>) -> Response {
    Json(json!({"status": "ok", "pid": std::process::id()})).into_response()
}

async fn list_sessions(State(state): State<Arc<ControlState>>) -> Response {
    let bridge = state.coordinator.bridge();
    let mut sessions = Vec::new();
    for session_id in bridge.session_ids().await {
        if let Some(runtime) = bridge.get(&session_id).await {
            sessions.push(runtime.with_state(|s| s.snapshot()).await);
        }
    }
    Json(json!({"sessions": sessions})).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    adapter: Option<String>,
}

async fn create_session(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let result = state
        .coordinator
        .create_session(CreateSessionOptions {
            cwd: body.cwd,
            model: body.model,
            adapter_name: body.adapter,
        })
        .await;
    match result {
        Ok(session_id) => {
            (StatusCode::CREATED, Json(json!({"session_id": session_id}))).into_response()
        }
        Err(e) => (
            StatusCode::from_u16(e.code().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({"error": e.to_string(), "code": e.code().as_str()})),
        )
            .into_response(),
    }
}

async fn delete_session(
    State(state): State<Arc<ControlState>>,
    UrlPath(session_id): UrlPath<String>,
) -> Response {
    match state.coordinator.delete_session(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown session {session_id}")})),
        )
            .into_response(),
    }
}

/// Build the control router with bearer auth on every route.
fn build_control_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", delete(delete_session))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_layer))
        .with_state(state)
}

/// Start the loopback control API on a random port and persist
/// `daemon.json`. Returns the bound port and the bearer token.
pub async fn start_control_api(
    coordinator: Arc<SessionCoordinator>,
    data_dir: &Path,
    shutdown: CancellationToken,
) -> Result<(u16, String)> {
    let token = generate_token();
    let state = Arc::new(ControlState { coordinator, token: token.clone() });
    let router = build_control_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Connection(format!("bind control api: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Connection(format!("local_addr: {e}")))?
        .port();

    let info = DaemonInfo { pid: std::process::id(), control_port: port, token: token.clone() };
    let info_path = data_dir.join("daemon.json");
    std::fs::write(&info_path, serde_json::to_vec_pretty(&info)?)
        .map_err(|e| Error::Storage(format!("write {}: {e}", info_path.display())))?;

    info!(port, "control api listening");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
    });
    Ok((port, token))
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
