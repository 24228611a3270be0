//! Credentials for the chat endpoint.
//!
//! The transport asks a [`CredentialProvider`] for a bearer token before each request and
//! asks it to refresh after a 401, within the limits of a [`RetryPolicy`]. The segmenter
//! and the session never see tokens.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::ChatConfig;
use crate::errors::{AuthError, ChatError};

/// How often, and how patiently, a request rejected with 401 is retried after a refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            backoff_factor: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn exponential(max_retries: u32, initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            backoff_factor: if backoff_factor > 0.0 { backoff_factor } else { 2.0 },
            max_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Delay before retry number `retries_done + 1`.
    pub fn backoff_duration(&self, retries_done: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(retries_done as i32);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Source of bearer tokens for outgoing chat requests.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, if any.
    async fn access_token(&self) -> Result<Option<String>, AuthError>;

    /// Obtains a new access token after `stale` was rejected.
    ///
    /// When another request already replaced `stale`, implementations return the newer
    /// token instead of refreshing again.
    async fn refresh(&self, stale: Option<&str>) -> Result<String, AuthError>;
}

/// Sends requests without an `Authorization` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait::async_trait]
impl CredentialProvider for Anonymous {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        Ok(None)
    }

    async fn refresh(&self, _stale: Option<&str>) -> Result<String, AuthError> {
        Err(AuthError::MissingRefreshToken)
    }
}

#[derive(Debug, Default, Clone)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// In-memory access/refresh token pair.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: RwLock<Tokens>,
}

impl TokenStore {
    pub fn new(access: Option<String>, refresh: Option<String>) -> Self {
        Self {
            tokens: RwLock::new(Tokens { access, refresh }),
        }
    }

    pub async fn access(&self) -> Option<String> {
        self.tokens.read().await.access.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.tokens.read().await.refresh.clone()
    }

    pub async fn set_access(&self, access: String) {
        self.tokens.write().await.access = Some(access);
    }

    /// Forgets both tokens (logout).
    pub async fn clear(&self) {
        *self.tokens.write().await = Tokens::default();
    }
}

#[derive(serde::Deserialize)]
struct RefreshResponse {
    access: String,
}

/// Token store backed by the backend's refresh endpoint.
///
/// Refreshes are serialized; requests that hit a 401 while another refresh is running wait
/// for it and reuse its token.
pub struct RefreshingCredentials {
    client: reqwest::Client,
    refresh_url: String,
    store: Arc<TokenStore>,
    refresh_lock: Mutex<()>,
}

impl RefreshingCredentials {
    pub fn new(
        store: Arc<TokenStore>,
        refresh_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build refresh client: {e}")))?;
        Ok(Self {
            client,
            refresh_url: refresh_url.into(),
            store,
            refresh_lock: Mutex::new(()),
        })
    }

    /// Seeds a store from the configured tokens and points at the configured refresh URL.
    pub fn from_config(config: &ChatConfig) -> Result<Self, ChatError> {
        let store = Arc::new(TokenStore::new(
            config.access_token.clone(),
            config.refresh_token.clone(),
        ));
        Self::new(store, config.refresh_url(), config.connect_timeout * 3)
    }

    pub fn store(&self) -> Arc<TokenStore> {
        self.store.clone()
    }
}

#[async_trait::async_trait]
impl CredentialProvider for RefreshingCredentials {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.store.access().await)
    }

    async fn refresh(&self, stale: Option<&str>) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(current) = self.store.access().await
            && Some(current.as_str()) != stale
        {
            debug!("access token already refreshed by a concurrent request");
            return Ok(current);
        }

        let refresh = self
            .store
            .refresh_token()
            .await
            .ok_or(AuthError::MissingRefreshToken)?;
        let response = self
            .client
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refresh": refresh }))
            .send()
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Refresh(format!(
                "refresh endpoint returned status {status}"
            )));
        }
        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Refresh(format!("invalid refresh response: {e}")))?;
        self.store.set_access(body.access.clone()).await;
        info!("access token refreshed");
        Ok(body.access)
    }
}

/// Guard run before a chat session is built for a page that needs a signed-in user.
pub async fn require_auth(provider: &dyn CredentialProvider) -> Result<(), ChatError> {
    match provider.access_token().await? {
        Some(token) if !token.trim().is_empty() => Ok(()),
        _ => Err(ChatError::Unauthenticated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedServer};

    #[test]
    fn none_policy_has_zero_retries() {
        let p = RetryPolicy::none();
        assert_eq!(p.max_retries, 0);
        assert!(!p.can_retry(0));
        assert_eq!(p.backoff_duration(0), Duration::ZERO);
    }

    #[test]
    fn exponential_policy_grows_with_cap() {
        let p = RetryPolicy::exponential(3, 100, 2.0).with_max_backoff(Duration::from_millis(250));
        assert!(p.can_retry(2));
        assert!(!p.can_retry(3));
        assert_eq!(p.backoff_duration(0).as_millis(), 100);
        assert_eq!(p.backoff_duration(1).as_millis(), 200);
        assert_eq!(p.backoff_duration(2).as_millis(), 250);
    }

    #[tokio::test]
    async fn require_auth_rejects_missing_token() {
        assert_eq!(
            require_auth(&Anonymous).await,
            Err(ChatError::Unauthenticated)
        );
        let creds = RefreshingCredentials::new(
            Arc::new(TokenStore::new(Some("t".into()), None)),
            "http://127.0.0.1:9/token/refresh/",
            Duration::from_secs(1),
        )
        .expect("creds");
        assert_eq!(require_auth(&creds).await, Ok(()));
        creds.store().clear().await;
        assert_eq!(require_auth(&creds).await, Err(ChatError::Unauthenticated));
    }

    #[tokio::test]
    async fn refresh_posts_refresh_token_and_stores_new_access() {
        let server = ScriptedServer::start(vec![Reply::json(200, r#"{"access":"fresh"}"#)]).await;
        let store = Arc::new(TokenStore::new(Some("old".into()), Some("r-1".into())));
        let creds = RefreshingCredentials::new(
            store.clone(),
            format!("{}/token/refresh/", server.url),
            Duration::from_secs(5),
        )
        .expect("creds");

        assert_eq!(creds.refresh(Some("old")).await, Ok("fresh".to_string()));
        assert_eq!(store.access().await.as_deref(), Some("fresh"));

        let requests = server.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("POST /token/refresh/"));
        assert!(requests[0].contains(r#"{"refresh":"r-1"}"#));
    }

    #[tokio::test]
    async fn refresh_reuses_token_replaced_by_concurrent_request() {
        let store = Arc::new(TokenStore::new(Some("newer".into()), Some("r".into())));
        let creds = RefreshingCredentials::new(
            store,
            "http://127.0.0.1:9/unused",
            Duration::from_secs(1),
        )
        .expect("creds");
        assert_eq!(creds.refresh(Some("older")).await, Ok("newer".to_string()));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails() {
        let creds = RefreshingCredentials::new(
            Arc::new(TokenStore::new(Some("old".into()), None)),
            "http://127.0.0.1:9/unused",
            Duration::from_secs(1),
        )
        .expect("creds");
        assert_eq!(
            creds.refresh(Some("old")).await,
            Err(AuthError::MissingRefreshToken)
        );
        assert_eq!(
            Anonymous.refresh(None).await,
            Err(AuthError::MissingRefreshToken)
        );
    }

    #[tokio::test]
    async fn rejected_refresh_surfaces_status() {
        let server = ScriptedServer::start(vec![Reply::json(401, r#"{"detail":"expired"}"#)]).await;
        let creds = RefreshingCredentials::new(
            Arc::new(TokenStore::new(None, Some("r".into()))),
            format!("{}/token/refresh/", server.url),
            Duration::from_secs(5),
        )
        .expect("creds");
        let err = creds.refresh(None).await.expect_err("should fail");
        assert!(matches!(err, AuthError::Refresh(msg) if msg.contains("401")));
    }
}
