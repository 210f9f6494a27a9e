use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyrelay_cache::{
    BasicCredentials, CircuitBreakerConfig, KeySpace, LocalCacheConfig, LockConfig,
    OAuthCredentials, RateLimitConfig, RedisStoreConfig, RedisTlsMaterial, RetryConfig,
    TokenCacheConfig, namespaces,
};
use skyrelay_config::sources::names;
use skyrelay_config::{ConfigError, SecretsConfig, SecretsProvider};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Shared cache backend
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Request budgets per endpoint class
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Upstream APIs
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Upstream credentials
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default derived via field defaults

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Redis validations
        if self.redis.enabled {
            if self.redis.url.is_none() && self.redis.host.is_empty() {
                return Err("redis requires either 'url' or 'host' to be set".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        if self.redis.key_prefix.trim().is_empty() {
            return Err("redis.key_prefix must not be empty".into());
        }
        // Cache validations
        if self.cache.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        if self.cache.janitor_interval_secs == 0 {
            return Err("cache.janitor_interval_secs must be > 0".into());
        }
        for (namespace, ttl) in self.cache.ttl.entries() {
            if ttl == 0 {
                return Err(format!("cache.ttl.{namespace} must be > 0"));
            }
        }
        // Circuit breaker validations
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.half_open_requests == 0 {
            return Err("circuit_breaker thresholds must be > 0".into());
        }
        if cb.reset_timeout_ms == 0 {
            return Err("circuit_breaker.reset_timeout_ms must be > 0".into());
        }
        // Rate limit validations
        let rules = std::iter::once(("default", &self.rate_limit.default)).chain(
            self.rate_limit
                .classes
                .iter()
                .map(|(class, rule)| (class.as_str(), rule)),
        );
        for (class, rule) in rules {
            if rule.max_requests == 0 || rule.window_ms == 0 {
                return Err(format!(
                    "rate_limit.{class} requires max_requests > 0 and window_ms > 0"
                ));
            }
        }
        // Lock and retry validations
        if self.locks.ttl_secs == 0 {
            return Err("locks.ttl_secs must be > 0".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms must be <= retry.max_delay_ms".into());
        }
        // Upstream validation
        if self.upstream.timeout_ms == 0 {
            return Err("upstream.timeout_ms must be > 0".into());
        }
        for (name, base) in [
            ("airport_base_url", &self.upstream.airport_base_url),
            ("flight_base_url", &self.upstream.flight_base_url),
        ] {
            url::Url::parse(base).map_err(|e| format!("upstream.{name} is not a valid URL: {e}"))?;
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Auth validation
        self.auth.validate()?;
        Ok(())
    }

    /// Fill empty secret slots from the secrets provider and decrypt `enc:`
    /// values already present in the file.
    pub async fn resolve_secrets(&mut self, secrets: &SecretsProvider) -> Result<(), ConfigError> {
        secrets
            .fill(&mut self.redis.password, names::REDIS_PASSWORD)
            .await?;
        secrets
            .fill(&mut self.redis.tls.cert, names::REDIS_TLS_CERT)
            .await?;
        secrets
            .fill(&mut self.redis.tls.key, names::REDIS_TLS_KEY)
            .await?;
        secrets.fill(&mut self.redis.tls.ca, names::REDIS_TLS_CA).await?;
        secrets
            .fill(&mut self.upstream.airport_api_key, names::AIRPORT_API_KEY)
            .await?;
        secrets
            .fill(&mut self.auth.oauth.client_id, names::OAUTH_CLIENT_ID)
            .await?;
        secrets
            .fill(&mut self.auth.oauth.client_secret, names::OAUTH_CLIENT_SECRET)
            .await?;
        secrets
            .fill(&mut self.auth.basic.username, names::BASIC_USERNAME)
            .await?;
        secrets
            .fill(&mut self.auth.basic.password, names::BASIC_PASSWORD)
            .await?;

        self.auth.validate_resolved().map_err(ConfigError::validation)
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(&self.redis.key_prefix)
    }

    /// Copy with every secret slot masked, for display.
    pub fn redacted(&self) -> Self {
        fn mask(value: &mut String) {
            if !value.is_empty() {
                *value = "***".to_string();
            }
        }

        let mut cfg = self.clone();
        mask(&mut cfg.redis.password);
        mask(&mut cfg.redis.tls.key);
        mask(&mut cfg.upstream.airport_api_key);
        mask(&mut cfg.auth.oauth.client_secret);
        mask(&mut cfg.auth.basic.password);
        mask(&mut cfg.secrets.vault.token);
        cfg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (local-only for single-instance deployments)
    #[serde(default)]
    pub enabled: bool,

    /// Full connection URL; when set, host/port/db are ignored
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: u32,

    #[serde(default)]
    pub username: Option<String>,

    /// Falls back to the `REDIS_PASSWORD` secret when empty
    #[serde(default)]
    pub password: String,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for every key this deployment writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub tls: RedisTlsConfig,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_key_prefix() -> String {
    "skyrelay".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            username: None,
            password: String::new(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_key_prefix(),
            tls: RedisTlsConfig::default(),
        }
    }
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn store_config(&self) -> Result<RedisStoreConfig, ConfigError> {
        let tls = if self.tls.enabled {
            Some(self.tls.material()?)
        } else {
            None
        };

        Ok(RedisStoreConfig {
            url: self.connection_url(),
            username: self.username.clone(),
            password: Some(self.password.clone()).filter(|p| !p.is_empty()),
            pool_size: self.pool_size,
            timeout_ms: self.timeout_ms,
            tls,
        })
    }
}

/// TLS settings. `cert`, `key` and `ca` accept either a file path or inline
/// PEM text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub ca: String,
    /// Verify the server certificate
    #[serde(default = "default_reject_unauthorized")]
    pub reject_unauthorized: bool,
}

fn default_reject_unauthorized() -> bool {
    true
}

impl Default for RedisTlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: String::new(),
            key: String::new(),
            ca: String::new(),
            reject_unauthorized: default_reject_unauthorized(),
        }
    }
}

impl RedisTlsConfig {
    pub fn material(&self) -> Result<RedisTlsMaterial, ConfigError> {
        if self.cert.is_empty() != self.key.is_empty() {
            return Err(ConfigError::validation(
                "redis.tls.cert and redis.tls.key must be set together",
            ));
        }

        Ok(RedisTlsMaterial {
            cert: load_pem(&self.cert)?,
            key: load_pem(&self.key)?,
            ca: load_pem(&self.ca)?,
            reject_unauthorized: self.reject_unauthorized,
        })
    }
}

fn load_pem(value: &str) -> Result<Option<Vec<u8>>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if value.starts_with("-----BEGIN") {
        return Ok(Some(value.as_bytes().to_vec()));
    }
    std::fs::read(value).map(Some).map_err(ConfigError::from)
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub ttl: CacheTtlConfig,

    /// Local tier max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,

    /// Namespaces reported by `stats`
    #[serde(default = "default_stats_namespaces")]
    pub stats_namespaces: Vec<String>,
}

fn default_local_max_entries() -> usize {
    10_000
}

fn default_janitor_interval_secs() -> u64 {
    60
}

fn default_stats_namespaces() -> Vec<String> {
    [
        namespaces::AIRPORT,
        namespaces::FLIGHT_STATE,
        namespaces::TRACK,
        namespaces::ARRIVALS,
        namespaces::DEPARTURES,
    ]
    .iter()
    .map(|ns| ns.to_string())
    .collect()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: CacheTtlConfig::default(),
            local_max_entries: default_local_max_entries(),
            janitor_interval_secs: default_janitor_interval_secs(),
            stats_namespaces: default_stats_namespaces(),
        }
    }
}

impl CacheConfig {
    pub fn local(&self) -> LocalCacheConfig {
        LocalCacheConfig {
            max_entries: self.local_max_entries,
            janitor_interval_secs: self.janitor_interval_secs,
        }
    }
}

/// Default TTL per namespace, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_airport_ttl")]
    pub airport: u64,
    #[serde(default = "default_flight_state_ttl")]
    pub flight_state: u64,
    #[serde(default = "default_track_ttl")]
    pub track: u64,
    #[serde(default = "default_schedule_ttl")]
    pub arrivals: u64,
    #[serde(default = "default_schedule_ttl")]
    pub departures: u64,
}

fn default_airport_ttl() -> u64 {
    86_400 // airports rarely change
}

fn default_flight_state_ttl() -> u64 {
    10
}

fn default_track_ttl() -> u64 {
    60
}

fn default_schedule_ttl() -> u64 {
    300
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            airport: default_airport_ttl(),
            flight_state: default_flight_state_ttl(),
            track: default_track_ttl(),
            arrivals: default_schedule_ttl(),
            departures: default_schedule_ttl(),
        }
    }
}

impl CacheTtlConfig {
    fn entries(&self) -> [(&'static str, u64); 5] {
        [
            (namespaces::AIRPORT, self.airport),
            (namespaces::FLIGHT_STATE, self.flight_state),
            (namespaces::TRACK, self.track),
            (namespaces::ARRIVALS, self.arrivals),
            (namespaces::DEPARTURES, self.departures),
        ]
    }

    /// TTL for a namespace; unknown namespaces get the flight-state TTL.
    pub fn for_namespace(&self, namespace: &str) -> Duration {
        let secs = self
            .entries()
            .into_iter()
            .find(|(ns, _)| *ns == namespace)
            .map(|(_, secs)| secs)
            .unwrap_or(self.flight_state);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_airport_base_url")]
    pub airport_base_url: String,

    /// Falls back to the `AIRPORT_API_KEY` secret when empty
    #[serde(default)]
    pub airport_api_key: String,

    #[serde(default = "default_flight_base_url")]
    pub flight_base_url: String,

    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_airport_base_url() -> String {
    "https://airportdb.io/api/v1".to_string()
}

fn default_flight_base_url() -> String {
    "https://opensky-network.org/api".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            airport_base_url: default_airport_base_url(),
            airport_api_key: String::new(),
            flight_base_url: default_flight_base_url(),
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub oauth: OAuthSettings,
    /// Legacy Basic-Auth, used when OAuth2 is absent or failing
    #[serde(default)]
    pub basic: BasicSettings,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub token_url: String,
    /// Refresh this many seconds before expiry
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,
    #[serde(default = "default_token_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_refresh_buffer_secs() -> u64 {
    300
}

fn default_token_timeout_ms() -> u64 {
    10_000
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: String::new(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
            timeout_ms: default_token_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .field("refresh_buffer_secs", &self.refresh_buffer_secs)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct BasicSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for BasicSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicSettings")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl AuthConfig {
    /// Checks what the file alone must get right. Client id and secrets may
    /// still arrive from the secrets provider.
    pub fn validate(&self) -> Result<(), String> {
        let oauth = &self.oauth;
        if !oauth.client_id.is_empty() && oauth.token_url.is_empty() {
            return Err("auth.oauth requires both client_id and token_url".into());
        }
        if !oauth.token_url.is_empty() {
            url::Url::parse(&oauth.token_url)
                .map_err(|e| format!("auth.oauth.token_url is not a valid URL: {e}"))?;
        }
        if oauth.refresh_buffer_secs == 0 {
            return Err("auth.oauth.refresh_buffer_secs must be > 0".into());
        }
        if !self.basic.password.is_empty() && self.basic.username.is_empty() {
            return Err("auth.basic.password set without auth.basic.username".into());
        }
        Ok(())
    }

    /// Once secrets are resolved a configured token URL needs the full
    /// client credentials.
    pub fn validate_resolved(&self) -> Result<(), String> {
        self.validate()?;
        let oauth = &self.oauth;
        if !oauth.token_url.is_empty()
            && (oauth.client_id.is_empty() || oauth.client_secret.is_empty())
        {
            return Err("auth.oauth.token_url set but client_id or client_secret is missing".into());
        }
        if !self.basic.username.is_empty() && self.basic.password.is_empty() {
            return Err("auth.basic.username set without a password".into());
        }
        Ok(())
    }

    pub fn token_cache_config(&self) -> TokenCacheConfig {
        let oauth = &self.oauth;
        let oauth_credentials = (!oauth.client_id.is_empty()
            && !oauth.client_secret.is_empty()
            && !oauth.token_url.is_empty())
        .then(|| OAuthCredentials {
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
            token_url: oauth.token_url.clone(),
        });

        let basic = &self.basic;
        let basic_credentials = (!basic.username.is_empty()).then(|| BasicCredentials {
            username: basic.username.clone(),
            password: basic.password.clone(),
        });

        TokenCacheConfig {
            oauth: oauth_credentials,
            basic: basic_credentials,
            refresh_buffer_secs: oauth.refresh_buffer_secs,
            request_timeout_ms: oauth.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default config file looked up in the working directory.
    pub const DEFAULT_CONFIG_PATH: &str = "skyrelay.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "Config file not found, using defaults");
        }
        // Environment variable overrides, e.g., SKYRELAY__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("SKYRELAY")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_connection_url_from_parts() {
        let redis = RedisConfig {
            host: "cache.internal".into(),
            port: 6380,
            db: 2,
            ..Default::default()
        };
        assert_eq!(redis.connection_url(), "redis://cache.internal:6380/2");

        let redis = RedisConfig {
            url: Some("redis://other:6379".into()),
            ..redis
        };
        assert_eq!(redis.connection_url(), "redis://other:6379");
    }

    #[test]
    fn test_half_oauth_rejected() {
        let mut cfg = AppConfig::default();
        cfg.auth.oauth.client_id = "skyrelay".into();
        assert!(cfg.validate().unwrap_err().contains("client_id and token_url"));

        cfg.auth.oauth.token_url = "https://auth.example.com/token".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_token_cache_config_requires_secret() {
        let mut auth = AuthConfig::default();
        auth.oauth.client_id = "id".into();
        auth.oauth.token_url = "https://auth.example.com/token".into();
        assert!(auth.token_cache_config().oauth.is_none());

        auth.oauth.client_secret = "secret".into();
        auth.basic.username = "legacy".into();
        let tc = auth.token_cache_config();
        assert!(tc.oauth.is_some());
        assert!(tc.basic.is_some());
    }

    #[test]
    fn test_inline_pem_and_paths() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----";
        assert_eq!(load_pem(pem).unwrap().unwrap(), pem.as_bytes());
        assert!(load_pem("").unwrap().is_none());
        assert!(load_pem("/definitely/not/here.pem").is_err());

        let tls = RedisTlsConfig {
            enabled: true,
            cert: pem.into(),
            ..Default::default()
        };
        assert!(tls.material().is_err());
    }

    #[test]
    fn test_ttl_lookup() {
        let ttl = CacheTtlConfig::default();
        assert_eq!(ttl.for_namespace(namespaces::AIRPORT), Duration::from_secs(86_400));
        assert_eq!(ttl.for_namespace(namespaces::TRACK), Duration::from_secs(60));
        assert_eq!(ttl.for_namespace("unknown"), Duration::from_secs(10));
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut cfg = AppConfig::default();
        cfg.redis.password = "hunter2".into();
        cfg.auth.oauth.client_secret = "s3cret".into();
        let shown = toml::to_string(&cfg.redacted()).unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("s3cret"));
    }
}
