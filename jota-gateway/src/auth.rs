//! Credential validation against the JotaDB auth backend, with caching.
//!
//! Every (client id, api key) pair is authoritatively validated by the
//! backend's `/auth/internal` endpoint; successful validations are cached
//! for [`CACHE_TTL`] so a burst of connections from the same client costs
//! one upstream round-trip. The cache never raises: network failures and
//! malformed responses are logged and reported as a plain rejection, and
//! stale entries are left in place so a later success can overwrite them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::AuthSettings;

/// How long a successful validation stays fresh.
pub const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

const CONNECT_TIMEOUT_AUTH: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT_HEALTH: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Advisory scheduling priority reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A validated client's configuration. Replaced wholesale on
/// re-validation, never mutated in place.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub api_key: String,
    pub max_sessions: u32,
    pub priority: Priority,
    pub description: String,
    pub last_validated: Instant,
}

#[derive(Debug, Default, Deserialize)]
struct BackendClientConfig {
    max_sessions: Option<u32>,
    priority: Option<Priority>,
    description: Option<String>,
}

/// Backend response body. The nested `config` object is the documented
/// shape; the flat keys are accepted as a fallback.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    authorized: Option<bool>,
    error: Option<String>,
    config: Option<BackendClientConfig>,
    max_sessions: Option<u32>,
    priority: Option<Priority>,
    description: Option<String>,
}

/// TTL-bounded cache over the JotaDB credential service.
pub struct CredentialCache {
    auth_http: reqwest::Client,
    health_http: reqwest::Client,
    settings: AuthSettings,
    ttl: Duration,
    cache: Mutex<HashMap<String, ClientConfig>>,
}

impl CredentialCache {
    pub fn new(settings: AuthSettings) -> Self {
        Self::with_ttl(settings, CACHE_TTL)
    }

    /// Cache with a custom TTL; `new` uses [`CACHE_TTL`].
    pub fn with_ttl(settings: AuthSettings, ttl: Duration) -> Self {
        // Certificate verification is disabled so self-signed backend
        // deployments work out of the box.
        let auth_http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT_AUTH)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to create HTTP client");
        let health_http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT_HEALTH)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            auth_http,
            health_http,
            settings,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Startup probe of `{base}/health`. True iff the backend answers 200.
    pub async fn verify_backend_liveness(&self) -> bool {
        let url = format!("{}/health", self.settings.base_url);
        let result = self
            .health_http
            .get(&url)
            .bearer_auth(&self.settings.service_key)
            .timeout(READ_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                tracing::error!("JotaDB health check returned HTTP {}", response.status());
                false
            }
            Err(e) => {
                tracing::error!("JotaDB health check failed: {}", e);
                false
            }
        }
    }

    /// True iff the credentials are currently valid, consulting the cache
    /// first and the backend on miss, expiry, or key mismatch.
    pub async fn authenticate(&self, client_id: &str, api_key: &str) -> bool {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(client_id) {
                let age = entry.last_validated.elapsed();
                if age < self.ttl {
                    if entry.api_key == api_key {
                        return true;
                    }
                    // Key mismatch falls through to the backend in case the
                    // key was rotated.
                } else {
                    tracing::info!(
                        "Auth cache expired for {} ({}s), re-validating",
                        client_id,
                        age.as_secs()
                    );
                }
            }
        }

        tracing::info!("Validating {} via JotaDB", client_id);

        let url = format!("{}/auth/internal", self.settings.base_url);
        let result = self
            .auth_http
            .get(&url)
            .header("X-Client-ID", client_id)
            .header("X-API-Key", api_key)
            .bearer_auth(&self.settings.service_key)
            .timeout(READ_TIMEOUT)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("JotaDB request failed for {}: {}", client_id, e);
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            tracing::warn!(
                "JotaDB rejected {} with HTTP {}",
                client_id,
                response.status()
            );
            return false;
        }

        let body: AuthResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Malformed JotaDB response for {}: {}", client_id, e);
                return false;
            }
        };

        if let Some(error) = body.error {
            tracing::info!("Validation failed for {}: {}", client_id, error);
            return false;
        }

        if body.authorized != Some(true) {
            tracing::info!("Validation failed (not authorized) for {}", client_id);
            return false;
        }

        let nested = body.config.unwrap_or_default();
        let entry = ClientConfig {
            client_id: client_id.to_string(),
            api_key: api_key.to_string(),
            max_sessions: nested.max_sessions.or(body.max_sessions).unwrap_or(1),
            priority: nested.priority.or(body.priority).unwrap_or_default(),
            description: nested
                .description
                .or(body.description)
                .unwrap_or_default(),
            last_validated: Instant::now(),
        };

        tracing::info!(
            "Validation success for {} (max_sessions: {})",
            client_id,
            entry.max_sessions
        );
        self.cache
            .lock()
            .await
            .insert(client_id.to_string(), entry);
        true
    }

    /// Cached configuration for a client, if any validation ever succeeded.
    pub async fn config_for(&self, client_id: &str) -> Option<ClientConfig> {
        self.cache.lock().await.get(client_id).cloned()
    }

    /// True iff a cached entry exists, fresh or stale.
    pub async fn exists(&self, client_id: &str) -> bool {
        self.cache.lock().await.contains_key(client_id)
    }
}

#[cfg(test)]
impl CredentialCache {
    /// Insert a cache entry directly, bypassing the backend.
    pub(crate) async fn seed(&self, config: ClientConfig) {
        self.cache
            .lock()
            .await
            .insert(config.client_id.clone(), config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: &str) -> AuthSettings {
        AuthSettings {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_user: "gateway-test".to_string(),
            service_key: "sk_server".to_string(),
        }
    }

    async fn mock_authorized(server: &MockServer, client_id: &str, max_sessions: u32) {
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .and(header("X-Client-ID", client_id))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorized": true,
                "config": {
                    "max_sessions": max_sessions,
                    "priority": "high",
                    "description": "test client"
                }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_authenticate_success_with_nested_config() {
        let server = MockServer::start().await;
        mock_authorized(&server, "u1", 4).await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(cache.authenticate("u1", "k1").await);

        let config = cache.config_for("u1").await.unwrap();
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.priority, Priority::High);
        assert_eq!(config.description, "test client");
        assert!(cache.exists("u1").await);
    }

    #[tokio::test]
    async fn test_authenticate_flat_fallback_and_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"authorized": true})),
            )
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(cache.authenticate("u1", "k1").await);

        let config = cache.config_for("u1").await.unwrap();
        assert_eq!(config.max_sessions, 1);
        assert_eq!(config.priority, Priority::Normal);
        assert_eq!(config.description, "");
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"authorized": false})),
            )
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(!cache.authenticate("u1", "bad").await);
        assert!(!cache.exists("u1").await);
    }

    #[tokio::test]
    async fn test_authenticate_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error": "unknown client"})),
            )
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(!cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_authenticate_missing_authorized_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(!cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_authenticate_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(!cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_authenticate_network_error() {
        // Nothing listens here.
        let cache = CredentialCache::new(settings("http://127.0.0.1:9"));
        assert!(!cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_second_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"authorized": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(cache.authenticate("u1", "k1").await);
        assert!(cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_expired_entry_requeries_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"authorized": true})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let cache = CredentialCache::with_ttl(settings(&server.uri()), Duration::ZERO);
        assert!(cache.authenticate("u1", "k1").await);
        assert!(cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_key_mismatch_bypasses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .and(header("X-API-Key", "k1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"authorized": true})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/internal"))
            .and(header("X-API-Key", "stolen"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"authorized": false})),
            )
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(cache.authenticate("u1", "k1").await);
        assert!(!cache.authenticate("u1", "stolen").await);
        // The good cached entry survives the failed attempt.
        assert!(cache.authenticate("u1", "k1").await);
    }

    #[tokio::test]
    async fn test_liveness_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header("Authorization", "Bearer sk_server"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let cache = CredentialCache::new(settings(&server.uri()));
        assert!(cache.verify_backend_liveness().await);
    }

    #[tokio::test]
    async fn test_liveness_probe_unreachable() {
        let cache = CredentialCache::new(settings("http://127.0.0.1:9"));
        assert!(!cache.verify_backend_liveness().await);
    }

    #[tokio::test]
    async fn test_config_for_unknown_client() {
        let cache = CredentialCache::new(settings("http://127.0.0.1:9"));
        assert!(cache.config_for("ghost").await.is_none());
        assert!(!cache.exists("ghost").await);
    }
}
