//! WebSocket connection gateway.
//!
//! Owns the listening endpoint and the per-connection lifecycle. Each
//! connection gets an unbounded outbound channel whose receiver is drained
//! by the connection task's `select!` loop; workers and the telemetry
//! broadcaster hold senders and never touch the socket. Disconnect cleanup
//! (closing the client's sessions, dropping the telemetry subscription)
//! runs on the connection task before it exits.

pub mod router;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use jota_protocol::ServerMessage;

use crate::AppState;

/// Per-connection state, mutated only by the connection's own task.
pub struct ConnectionState {
    pub conn_id: u64,
    /// Set once the connection has authenticated, by header handshake or
    /// by an in-band `auth` message.
    pub client_id: Option<String>,
}

/// Build the gateway's HTTP router. The WebSocket endpoint is served on
/// `/` and on the reverse-proxy path `/api/inference`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/api/inference", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Upgrade handler with the header-based credential handshake.
///
/// Both `X-Client-ID` and `X-API-Key` present: validate before upgrading
/// and push `auth_success` on the fresh connection. Exactly one present:
/// reject. Neither present: upgrade unauthenticated, leaving the in-band
/// `auth` flow to the protocol router.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let client_id = header_value(&headers, "x-client-id");
    let api_key = header_value(&headers, "x-api-key");

    match (client_id, api_key) {
        (Some(client_id), Some(api_key)) => {
            if state.auth.authenticate(&client_id, &api_key).await {
                tracing::info!("Handshake authenticated client {}", client_id);
                ws.on_upgrade(move |socket| handle_connection(socket, state, Some(client_id)))
            } else {
                reject(StatusCode::UNAUTHORIZED, "Invalid credentials")
            }
        }
        (None, None) => ws.on_upgrade(move |socket| handle_connection(socket, state, None)),
        _ => reject(
            StatusCode::UNAUTHORIZED,
            "Missing X-Client-ID or X-API-Key headers",
        ),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn reject(status: StatusCode, error: &str) -> Response {
    (status, Json(serde_json::json!({ "error": error }))).into_response()
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    header_client: Option<String>,
) {
    let conn_id = state.next_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut conn = ConnectionState {
        conn_id,
        client_id: header_client,
    };

    // Greet the client: header-authenticated connections learn their
    // limits right away, the rest are told to authenticate.
    match conn.client_id.as_deref() {
        Some(client_id) => {
            let max_sessions = state
                .auth
                .config_for(client_id)
                .await
                .map_or(1, |c| c.max_sessions);
            let _ = tx.send(ServerMessage::AuthSuccess {
                client_id: client_id.to_string(),
                max_sessions,
            });
        }
        None => {
            let _ = tx.send(ServerMessage::Hello {
                status: "ready".to_string(),
                uptime_seconds: state.started_at.elapsed().as_secs(),
                requires_auth: true,
            });
        }
    }

    tracing::info!("Client connected (conn {})", conn_id);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(json)).await {
                    tracing::debug!("Send failed on conn {}: {}", conn_id, e);
                    break;
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        state.router.handle(&mut conn, &tx, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary, pong
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error on conn {}: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    // Cleanup runs here on the connection task, before the socket is
    // gone: sessions first, then the telemetry subscription.
    if let Some(client_id) = &conn.client_id {
        state.registry.close_client_sessions(client_id).await;
    }
    state.subscribers.remove(conn_id);

    tracing::info!("Client disconnected (conn {})", conn_id);
}
