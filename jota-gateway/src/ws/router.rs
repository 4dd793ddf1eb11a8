//! Protocol router.
//!
//! One inbound frame in, zero or more reply frames out, plus side effects
//! on the registry, dispatcher and subscriber set. Replies always go
//! through the connection's outbound channel, so the router can be called
//! for any connection from any task.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use jota_protocol::{AbortStatus, ClientMessage, ServerMessage};

use crate::auth::CredentialCache;
use crate::broadcast::SubscriberSet;
use crate::dispatch::{InferenceDispatcher, Task};
use crate::session::registry::SessionRegistry;
use crate::session::Session;
use crate::ws::ConnectionState;

const KNOWN_OPS: [&str; 8] = [
    "hello",
    "auth",
    "create_session",
    "close_session",
    "infer",
    "abort",
    "subscribe_metrics",
    "unsubscribe_metrics",
];

/// Deliberately identical for "missing" and "not yours", so session ids
/// cannot be probed.
const DENIED: &str = "Session not found or access denied";

/// Routes parsed messages to the subsystems.
pub struct MessageRouter {
    auth: Arc<CredentialCache>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<InferenceDispatcher>,
    subscribers: Arc<SubscriberSet>,
    started_at: Instant,
}

impl MessageRouter {
    pub fn new(
        auth: Arc<CredentialCache>,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<InferenceDispatcher>,
        subscribers: Arc<SubscriberSet>,
        started_at: Instant,
    ) -> Self {
        Self {
            auth,
            registry,
            dispatcher,
            subscribers,
            started_at,
        }
    }

    /// Handle one raw text frame from `conn`.
    pub async fn handle(
        &self,
        conn: &mut ConnectionState,
        tx: &UnboundedSender<ServerMessage>,
        raw: &str,
    ) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                send_error(tx, format!("Invalid JSON: {}", e));
                return;
            }
        };

        let Some(op) = value.get("op").and_then(|v| v.as_str()).map(str::to_string) else {
            send_error(tx, "Missing 'op' field".to_string());
            return;
        };

        if !KNOWN_OPS.contains(&op.as_str()) {
            send_error(tx, format!("Unknown operation: {}", op));
            return;
        }

        // Missing auth credentials get the dedicated failure frame.
        if op == "auth"
            && (value.get("client_id").is_none() || value.get("api_key").is_none())
        {
            let _ = tx.send(ServerMessage::AuthFailed {
                reason: "Missing client_id or api_key".to_string(),
            });
            return;
        }

        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                send_error(tx, format!("Invalid '{}' request: {}", op, e));
                return;
            }
        };

        match message {
            ClientMessage::Hello => self.handle_hello(tx),
            ClientMessage::Auth { client_id, api_key } => {
                self.handle_auth(conn, tx, client_id, api_key).await
            }
            ClientMessage::CreateSession => self.handle_create_session(conn, tx).await,
            ClientMessage::CloseSession { session_id } => {
                self.handle_close_session(conn, tx, session_id).await
            }
            ClientMessage::Infer {
                session_id,
                prompt,
                params,
            } => self.handle_infer(conn, tx, session_id, prompt, params).await,
            ClientMessage::Abort { session_id } => {
                self.handle_abort(conn, tx, session_id).await
            }
            ClientMessage::SubscribeMetrics => self.handle_subscribe(conn, tx),
            ClientMessage::UnsubscribeMetrics => self.handle_unsubscribe(conn, tx),
        }
    }

    fn handle_hello(&self, tx: &UnboundedSender<ServerMessage>) {
        let _ = tx.send(ServerMessage::Hello {
            status: "ready".to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            requires_auth: true,
        });
    }

    async fn handle_auth(
        &self,
        conn: &mut ConnectionState,
        tx: &UnboundedSender<ServerMessage>,
        client_id: String,
        api_key: String,
    ) {
        if !self.auth.authenticate(&client_id, &api_key).await {
            let _ = tx.send(ServerMessage::AuthFailed {
                reason: "Invalid credentials".to_string(),
            });
            return;
        }

        let max_sessions = self
            .auth
            .config_for(&client_id)
            .await
            .map_or(1, |c| c.max_sessions);
        conn.client_id = Some(client_id.clone());

        let _ = tx.send(ServerMessage::AuthSuccess {
            client_id,
            max_sessions,
        });
    }

    async fn handle_create_session(
        &self,
        conn: &ConnectionState,
        tx: &UnboundedSender<ServerMessage>,
    ) {
        let Some(client_id) = conn.client_id.as_deref() else {
            let _ = tx.send(ServerMessage::SessionError {
                error: "Not authenticated".to_string(),
            });
            return;
        };

        match self.registry.create_session(client_id).await {
            Ok(session_id) => {
                let _ = tx.send(ServerMessage::SessionCreated { session_id });
            }
            Err(e) => {
                tracing::warn!("Session creation failed for {}: {}", client_id, e);
                let _ = tx.send(ServerMessage::SessionError {
                    error: e.to_string(),
                });
            }
        }
    }

    async fn handle_close_session(
        &self,
        conn: &ConnectionState,
        tx: &UnboundedSender<ServerMessage>,
        session_id: String,
    ) {
        if !self.require_auth(conn, tx) {
            return;
        }
        if self.owned_session(conn, &session_id).await.is_none() {
            send_error(tx, DENIED.to_string());
            return;
        }

        if self.registry.close_session(&session_id).await {
            let _ = tx.send(ServerMessage::SessionClosed { session_id });
        } else {
            send_error(tx, DENIED.to_string());
        }
    }

    async fn handle_infer(
        &self,
        conn: &ConnectionState,
        tx: &UnboundedSender<ServerMessage>,
        session_id: String,
        prompt: String,
        params: jota_protocol::InferParams,
    ) {
        if !self.require_auth(conn, tx) {
            return;
        }
        if self.owned_session(conn, &session_id).await.is_none() {
            send_error(tx, DENIED.to_string());
            return;
        }

        let token_tx = tx.clone();
        let complete_tx = tx.clone();

        self.dispatcher.enqueue(Task {
            session_id: session_id.clone(),
            prompt,
            params,
            on_token: Box::new(move |sid, piece| {
                token_tx
                    .send(ServerMessage::Token {
                        session_id: sid.to_string(),
                        content: piece.to_string(),
                    })
                    .is_ok()
            }),
            on_complete: Box::new(move |sid, stats| {
                let _ = complete_tx.send(ServerMessage::End {
                    session_id: sid.to_string(),
                    stats,
                });
            }),
        });

        tracing::info!("Inference enqueued for session {}", session_id);
    }

    async fn handle_abort(
        &self,
        conn: &ConnectionState,
        tx: &UnboundedSender<ServerMessage>,
        session_id: String,
    ) {
        if !self.require_auth(conn, tx) {
            return;
        }

        match self.registry.get(&session_id).await {
            Some(session) if Some(session.client_id()) == conn.client_id.as_deref() => {
                let status = if self.dispatcher.abort(&session_id).await {
                    AbortStatus::Aborted
                } else {
                    AbortStatus::NotFound
                };
                let _ = tx.send(ServerMessage::Abort { session_id, status });
            }
            Some(_) => send_error(tx, DENIED.to_string()),
            None => {
                let _ = tx.send(ServerMessage::Abort {
                    session_id,
                    status: AbortStatus::NotFound,
                });
            }
        }
    }

    fn handle_subscribe(&self, conn: &ConnectionState, tx: &UnboundedSender<ServerMessage>) {
        if !self.require_auth(conn, tx) {
            return;
        }
        self.subscribers.insert(conn.conn_id, tx.clone());
        let _ = tx.send(ServerMessage::MetricsSubscribed {
            message: "Subscribed to metrics updates".to_string(),
        });
    }

    fn handle_unsubscribe(&self, conn: &ConnectionState, tx: &UnboundedSender<ServerMessage>) {
        if !self.require_auth(conn, tx) {
            return;
        }
        self.subscribers.remove(conn.conn_id);
        let _ = tx.send(ServerMessage::MetricsUnsubscribed {
            message: "Unsubscribed from metrics updates".to_string(),
        });
    }

    fn require_auth(&self, conn: &ConnectionState, tx: &UnboundedSender<ServerMessage>) -> bool {
        if conn.client_id.is_some() {
            return true;
        }
        send_error(tx, "Not authenticated".to_string());
        false
    }

    /// The session, iff it exists and belongs to this connection's client.
    async fn owned_session(
        &self,
        conn: &ConnectionState,
        session_id: &str,
    ) -> Option<Arc<Session>> {
        let session = self.registry.get(session_id).await?;
        if Some(session.client_id()) == conn.client_id.as_deref() {
            Some(session)
        } else {
            None
        }
    }
}

fn send_error(tx: &UnboundedSender<ServerMessage>, error: String) {
    tracing::warn!("Protocol error: {}", error);
    let _ = tx.send(ServerMessage::Error { error });
}
