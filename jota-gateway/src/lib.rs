pub mod auth;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod env_file;
pub mod monitor;
pub mod session;
pub mod ws;

pub use auth::CredentialCache;
pub use broadcast::{MetricsBroadcaster, SubscriberSet};
pub use config::{Args, AuthSettings, Settings};
pub use dispatch::InferenceDispatcher;
pub use env_file::EnvFile;
pub use monitor::HardwareMonitor;
pub use session::registry::SessionRegistry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ws::router::MessageRouter;

/// Shared application state.
pub struct AppState {
    pub auth: Arc<CredentialCache>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<InferenceDispatcher>,
    pub subscribers: Arc<SubscriberSet>,
    pub monitor: Arc<HardwareMonitor>,
    pub router: MessageRouter,
    pub started_at: Instant,
    next_conn_id: AtomicU64,
}

impl AppState {
    pub fn new(
        auth: Arc<CredentialCache>,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<InferenceDispatcher>,
        subscribers: Arc<SubscriberSet>,
        monitor: Arc<HardwareMonitor>,
    ) -> Self {
        let started_at = Instant::now();
        let router = MessageRouter::new(
            auth.clone(),
            registry.clone(),
            dispatcher.clone(),
            subscribers.clone(),
            started_at,
        );

        Self {
            auth,
            registry,
            dispatcher,
            subscribers,
            monitor,
            router,
            started_at,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}
