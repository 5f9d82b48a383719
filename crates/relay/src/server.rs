// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consumer-facing WebSocket transport.
//!
//! One route: `/ws/consumer/{session_id}`. Origin is checked at upgrade
//! time; session id shape, auth, and frame policing happen right after the
//! upgrade so the close codes of the consumer protocol can be used.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::bridge::SessionBridge;
use crate::broadcast::ConsumerSink;
use crate::error::{close, Error, Result};

/// Shared transport state.
pub struct GatewayState {
    pub bridge: Arc<SessionBridge>,
    /// `None` allows any origin (including none at all, for CLI clients).
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Build the consumer router.
///
/// The Origin allowlist is enforced in the upgrade handler; the CORS layer
/// only covers plain-HTTP probes of the route.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws/consumer/{session_id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown. Returns the bound address.
pub async fn serve(
    state: Arc<GatewayState>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Connection(format!("bind {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| Error::Connection(format!("local_addr: {e}")))?;
    let router = build_router(state);
    info!(addr = %local, "consumer websocket listening");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
    });
    Ok(local)
}

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // A disallowed Origin is rejected during the upgrade itself.
    if let Some(allowed) = &state.allowed_origins {
        if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
            if !allowed.iter().any(|a| a == origin) {
                debug!(origin, "rejecting disallowed origin");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }

    ws.on_upgrade(move |socket| handle_connection(state, session_id, query.token, socket))
        .into_response()
}

enum SinkCommand {
    Text(String),
    Close(u16, String),
}

/// Consumer sink backed by a writer task owning the socket's send half.
struct WsConsumerSink {
    tx: mpsc::Sender<SinkCommand>,
}

#[async_trait]
impl ConsumerSink for WsConsumerSink {
    async fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(SinkCommand::Text(text))
            .await
            .map_err(|_| Error::Connection("consumer socket writer gone".to_owned()))
    }

    async fn close(&self, code: u16, reason: String) {
        let _ = self.tx.send(SinkCommand::Close(code, reason)).await;
    }
}

async fn handle_connection(
    state: Arc<GatewayState>,
    session_id: String,
    token: Option<String>,
    socket: WebSocket,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SinkCommand>(256);

    // Writer task: the only owner of the send half. Ends on Close or when
    // every sink handle drops.
    let writer = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SinkCommand::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SinkCommand::Close(code, reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let sink: Arc<dyn ConsumerSink> = Arc::new(WsConsumerSink { tx: cmd_tx.clone() });

    // Session ids must be UUIDs; anything else is a policy violation.
    if uuid::Uuid::parse_str(&session_id).is_err() {
        sink.close(close::POLICY, "invalid session id".to_owned()).await;
        let _ = writer.await;
        return;
    }

    let socket_id = state
        .bridge
        .handle_consumer_open(&session_id, Arc::clone(&sink), token.as_deref())
        .await;
    let Some(socket_id) = socket_id else {
        // The bridge closed the sink with 4404/4401.
        let _ = writer.await;
        return;
    };

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state
                    .bridge
                    .handle_consumer_message(&session_id, socket_id, text.as_str())
                    .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.bridge.handle_consumer_close(&session_id, socket_id).await;
    drop(sink);
    drop(cmd_tx);
    let _ = writer.await;
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
