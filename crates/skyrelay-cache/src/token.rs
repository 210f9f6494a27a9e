//! Upstream credentials: OAuth2 client-credentials tokens with Basic-Auth
//! fallback.
//!
//! A bearer token is looked up in process memory, then in the shared store,
//! and only then fetched from the authorization server. Fetches go through
//! single-flight plus the distributed lock, so a fleet of instances refreshes
//! a token once rather than once per request. A token counts as valid only
//! while `expires_at > now + refresh_buffer`.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::concurrency::ConcurrencyManager;
use crate::error::{Error, Result};
use crate::key::{KeySpace, namespaces};
use crate::store::GuardedStore;

/// Seconds shaved off `expires_in` for the shared copy, so the shared store
/// never hands out a token that is about to die.
const SHARED_TTL_MARGIN_SECS: u64 = 60;

/// Used when the authorization server omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3_600;

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheConfig {
    #[serde(default)]
    pub oauth: Option<OAuthCredentials>,

    #[serde(default)]
    pub basic: Option<BasicCredentials>,

    /// Refresh this long before expiry
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_refresh_buffer_secs() -> u64 {
    300
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            oauth: None,
            basic: None,
            refresh_buffer_secs: default_refresh_buffer_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// A bearer token and when it stops being accepted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub token_type: String,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl TokenRecord {
    /// Valid while more than the effective refresh buffer remains.
    pub fn is_valid(&self, buffer: Duration) -> bool {
        self.expires_at > OffsetDateTime::now_utc() + self.effective_buffer(buffer)
    }

    /// `buffer`, capped at half the token's lifetime so tokens shorter than
    /// the buffer are still reused.
    pub fn effective_buffer(&self, buffer: Duration) -> Duration {
        let half_lifetime = (self.expires_at - self.issued_at) / 2_i32;
        buffer.min(Duration::try_from(half_lifetime).unwrap_or(Duration::ZERO))
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Ways of authenticating, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStrategy {
    OAuth,
    Basic,
}

struct Inner {
    config: TokenCacheConfig,
    http: reqwest::Client,
    store: Option<GuardedStore>,
    keys: KeySpace,
    concurrency: ConcurrencyManager,
    memory: RwLock<Option<TokenRecord>>,
}

/// Cheap to clone.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

impl TokenCache {
    pub fn new(
        config: TokenCacheConfig,
        store: Option<GuardedStore>,
        keys: KeySpace,
        concurrency: ConcurrencyManager,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                store,
                keys,
                concurrency,
                memory: RwLock::new(None),
            }),
        })
    }

    fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.inner.config.refresh_buffer_secs)
    }

    fn strategies(&self) -> Vec<AuthStrategy> {
        let mut strategies = Vec::with_capacity(2);
        if self.inner.config.oauth.is_some() {
            strategies.push(AuthStrategy::OAuth);
        }
        if self.inner.config.basic.is_some() {
            strategies.push(AuthStrategy::Basic);
        }
        strategies
    }

    /// Whether any credentials are configured.
    pub fn is_configured(&self) -> bool {
        !self.strategies().is_empty()
    }

    /// Headers for an authenticated upstream call.
    ///
    /// OAuth2 bearer first, then Basic-Auth. With no credentials configured
    /// the map is empty. When every configured strategy fails the result is
    /// `Error::AuthenticationRequired`.
    pub async fn auth_headers(&self) -> Result<HeaderMap> {
        let mut last_error = None;

        for strategy in self.strategies() {
            match self.headers_for(strategy).await {
                Ok(headers) => return Ok(headers),
                Err(e) => {
                    tracing::warn!(strategy = ?strategy, error = %e, "auth strategy failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(Error::AuthenticationRequired(e.to_string())),
            None => Ok(HeaderMap::new()),
        }
    }

    async fn headers_for(&self, strategy: AuthStrategy) -> Result<HeaderMap> {
        let value = match strategy {
            AuthStrategy::OAuth => {
                let record = self.valid_token().await?;
                format!("Bearer {}", record.token)
            }
            AuthStrategy::Basic => {
                let basic = self
                    .inner
                    .config
                    .basic
                    .as_ref()
                    .ok_or_else(|| Error::AuthenticationRequired("no basic credentials".into()))?;
                let encoded = BASE64.encode(format!("{}:{}", basic.username, basic.password));
                format!("Basic {encoded}")
            }
        };

        let mut value = HeaderValue::from_str(&value)
            .map_err(|e| Error::Internal(format!("invalid authorization header: {e}")))?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    /// A token with more than the refresh buffer left, fetching one if
    /// needed.
    pub async fn valid_token(&self) -> Result<TokenRecord> {
        let oauth = self
            .inner
            .config
            .oauth
            .clone()
            .ok_or_else(|| Error::AuthenticationRequired("no OAuth2 credentials".into()))?;
        let buffer = self.refresh_buffer();

        if let Some(record) = self.inner.memory.read().as_ref().filter(|r| r.is_valid(buffer)) {
            return Ok(record.clone());
        }

        if let Some(record) = self.shared_token(&oauth).await {
            *self.inner.memory.write() = Some(record.clone());
            return Ok(record);
        }

        let cache = self.clone();
        let flight_key = format!("{}:oauth:{}", namespaces::TOKEN, oauth.client_id);
        self.inner
            .concurrency
            .deduplicate(&flight_key, move || async move { cache.refresh(oauth).await })
            .await
    }

    /// Runs once per flight, under the distributed lock.
    async fn refresh(&self, oauth: OAuthCredentials) -> Result<TokenRecord> {
        // Another instance may have refreshed while we waited for the lock.
        if let Some(record) = self.shared_token(&oauth).await {
            *self.inner.memory.write() = Some(record.clone());
            return Ok(record);
        }

        let (record, expires_in) = match self.fetch(&oauth).await {
            Ok(fetched) => {
                crate::metrics::record_token_fetch("success");
                fetched
            }
            Err(e) => {
                crate::metrics::record_token_fetch("failure");
                return Err(e);
            }
        };

        if let Some(store) = self.inner.store.as_ref().filter(|s| s.is_available()) {
            let ttl = Duration::from_secs(expires_in.saturating_sub(SHARED_TTL_MARGIN_SECS).max(1));
            let key = self.token_key(&oauth);
            match serde_json::to_vec(&record) {
                Ok(bytes) => {
                    if let Err(e) = store.set_ex(&key, &bytes, ttl).await {
                        tracing::warn!(key = %key, error = %e, "failed to share token");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize token"),
            }
        }

        *self.inner.memory.write() = Some(record.clone());
        tracing::info!(
            client_id = %oauth.client_id,
            expires_at = %record.expires_at,
            "OAuth2 token refreshed"
        );
        Ok(record)
    }

    async fn fetch(&self, oauth: &OAuthCredentials) -> Result<(TokenRecord, u64)> {
        let response = self
            .inner
            .http
            .post(&oauth.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::TokenFetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::TokenFetchFailed(format!(
                "authorization server returned {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenFetchFailed(format!("invalid token response: {e}")))?;

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        if expires_in <= self.inner.config.refresh_buffer_secs {
            tracing::warn!(
                expires_in,
                refresh_buffer_secs = self.inner.config.refresh_buffer_secs,
                "token lifetime is within the refresh buffer, refreshing at half-life instead"
            );
        }

        let issued_at = OffsetDateTime::now_utc();
        let record = TokenRecord {
            token: body.access_token,
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            issued_at,
            expires_at: issued_at + Duration::from_secs(expires_in),
        };
        Ok((record, expires_in))
    }

    async fn shared_token(&self, oauth: &OAuthCredentials) -> Option<TokenRecord> {
        let store = self.inner.store.as_ref().filter(|s| s.is_available())?;
        let key = self.token_key(oauth);

        let bytes = match store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "shared token lookup failed");
                return None;
            }
        };

        match serde_json::from_slice::<TokenRecord>(&bytes) {
            Ok(record) if record.is_valid(self.refresh_buffer()) => Some(record),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding unreadable shared token");
                None
            }
        }
    }

    fn token_key(&self, oauth: &OAuthCredentials) -> String {
        self.inner
            .keys
            .raw(namespaces::TOKEN, &format!("oauth:{}", oauth.client_id))
    }

    /// Forget the current token in memory and in the shared store.
    pub async fn invalidate(&self) {
        *self.inner.memory.write() = None;

        if let (Some(oauth), Some(store)) =
            (self.inner.config.oauth.as_ref(), self.inner.store.as_ref())
        {
            let key = self.token_key(oauth);
            if let Err(e) = store.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "failed to drop shared token");
            }
        }
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("oauth", &self.inner.config.oauth)
            .field("basic", &self.inner.config.basic)
            .field("refresh_buffer_secs", &self.inner.config.refresh_buffer_secs)
            .finish()
    }
}
