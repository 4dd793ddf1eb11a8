//! Session registry: the sole owner of live sessions.
//!
//! Two indices under one lock: `session_id -> Session` and
//! `client_id -> [session_id]`. The lock is held only across map mutation,
//! never across context creation or generation.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;

use jota_runtime::{RuntimeError, TextModel};

use crate::auth::CredentialCache;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Client {0} has no validated configuration")]
    UnknownClient(String),

    #[error("Session limit reached ({0} max)")]
    QuotaExceeded(u32),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Default)]
struct Indexes {
    sessions: HashMap<String, Arc<Session>>,
    by_client: HashMap<String, Vec<String>>,
}

/// Keyed collection of sessions with per-client quota enforcement.
pub struct SessionRegistry {
    model: Arc<dyn TextModel>,
    ctx_size: u32,
    auth: Arc<CredentialCache>,
    inner: Mutex<Indexes>,
}

impl SessionRegistry {
    pub fn new(model: Arc<dyn TextModel>, ctx_size: u32, auth: Arc<CredentialCache>) -> Self {
        Self {
            model,
            ctx_size,
            auth,
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Create a session for `client_id`, enforcing its quota. The client
    /// must have a validated configuration in the credential cache.
    pub async fn create_session(&self, client_id: &str) -> Result<String, RegistryError> {
        let config = self
            .auth
            .config_for(client_id)
            .await
            .ok_or_else(|| RegistryError::UnknownClient(client_id.to_string()))?;

        {
            let inner = self.inner.lock().await;
            let current = inner.by_client.get(client_id).map_or(0, Vec::len);
            if current as u32 >= config.max_sessions {
                return Err(RegistryError::QuotaExceeded(config.max_sessions));
            }
        }

        // Context creation can be heavy, keep it outside the lock.
        let ctx = self.model.new_context(self.ctx_size)?;

        let mut inner = self.inner.lock().await;
        let current = inner.by_client.get(client_id).map_or(0, Vec::len);
        if current as u32 >= config.max_sessions {
            return Err(RegistryError::QuotaExceeded(config.max_sessions));
        }

        let mut session_id = generate_session_id();
        while inner.sessions.contains_key(&session_id) {
            session_id = generate_session_id();
        }

        let session = Arc::new(Session::new(
            session_id.clone(),
            client_id.to_string(),
            self.model.clone(),
            ctx,
        ));
        inner.sessions.insert(session_id.clone(), session);
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .push(session_id.clone());

        tracing::info!(
            "Created session {} for client {} ({}/{})",
            session_id,
            client_id,
            current + 1,
            config.max_sessions
        );
        Ok(session_id)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.lock().await.sessions.get(session_id).cloned()
    }

    /// Destroy a session. Idempotent for unknown ids. An in-flight
    /// generation is aborted so its worker stops within one token.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock().await;

        let Some(session) = inner.sessions.remove(session_id) else {
            return false;
        };
        session.abort();

        let client_id = session.client_id().to_string();
        if let Some(ids) = inner.by_client.get_mut(&client_id) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                inner.by_client.remove(&client_id);
            }
        }

        tracing::info!("Closed session {} for client {}", session_id, client_id);
        true
    }

    /// Set the abort flag of a session. False if the session is unknown.
    pub async fn abort_session(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Some(session) => {
                session.abort();
                true
            }
            None => false,
        }
    }

    /// Destroy every session owned by `client_id`; called on disconnect.
    pub async fn close_client_sessions(&self, client_id: &str) -> usize {
        let mut inner = self.inner.lock().await;

        let Some(ids) = inner.by_client.remove(client_id) else {
            return 0;
        };
        for id in &ids {
            if let Some(session) = inner.sessions.remove(id) {
                session.abort();
            }
        }

        tracing::info!("Closed {} session(s) for client {}", ids.len(), client_id);
        ids.len()
    }

    /// Destroy everything; used at shutdown.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        for session in inner.sessions.values() {
            session.abort();
        }
        let count = inner.sessions.len();
        inner.sessions.clear();
        inner.by_client.clear();

        if count > 0 {
            tracing::info!("Closed all {} session(s)", count);
        }
    }

    pub async fn count_for(&self, client_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_client
            .get(client_id)
            .map_or(0, Vec::len)
    }

    pub async fn total(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

/// Fresh id in the `sess_XXXXXXXX_XXXX` pattern (12 random hex digits).
fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    format!("sess_{:08x}_{:04x}", rng.gen::<u32>(), rng.gen::<u16>())
}
