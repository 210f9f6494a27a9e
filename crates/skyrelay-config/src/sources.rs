//! Secret sources: environment, mounted files, or a Vault KV v2 engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::secrets::{Keyring, SecretString, SecretValue};
use crate::{ConfigError, Result};

/// Well-known secret names.
pub mod names {
    pub const REDIS_PASSWORD: &str = "REDIS_PASSWORD";
    pub const REDIS_TLS_CERT: &str = "REDIS_TLS_CERT";
    pub const REDIS_TLS_KEY: &str = "REDIS_TLS_KEY";
    pub const REDIS_TLS_CA: &str = "REDIS_TLS_CA";
    pub const AIRPORT_API_KEY: &str = "AIRPORT_API_KEY";
    pub const OAUTH_CLIENT_ID: &str = "OAUTH_CLIENT_ID";
    pub const OAUTH_CLIENT_SECRET: &str = "OAUTH_CLIENT_SECRET";
    pub const BASIC_USERNAME: &str = "BASIC_USERNAME";
    pub const BASIC_PASSWORD: &str = "BASIC_PASSWORD";
}

/// Which backend secrets are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSourceKind {
    #[default]
    Env,
    File,
    Vault,
}

/// Vault KV v2 location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Vault address, e.g. "https://vault.internal:8200"
    #[serde(default = "default_vault_addr")]
    pub addr: String,
    /// Token sent as `X-Vault-Token`
    #[serde(default)]
    pub token: String,
    /// KV v2 mount point
    #[serde(default = "default_vault_mount")]
    pub mount: String,
    /// Secret path under the mount
    #[serde(default = "default_vault_path")]
    pub path: String,
    #[serde(default = "default_vault_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_vault_addr() -> String {
    "http://127.0.0.1:8200".to_string()
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_vault_path() -> String {
    "skyrelay".to_string()
}

fn default_vault_timeout_ms() -> u64 {
    5000
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: default_vault_addr(),
            token: String::new(),
            mount: default_vault_mount(),
            path: default_vault_path(),
            timeout_ms: default_vault_timeout_ms(),
        }
    }
}

/// Secrets configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub source: SecretSourceKind,

    /// Prefix for environment lookups (`<prefix><NAME>`)
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    /// Directory holding one file per secret (file source)
    #[serde(default = "default_secrets_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub vault: VaultConfig,
}

fn default_env_prefix() -> String {
    "SKYRELAY_".to_string()
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/run/secrets")
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            source: SecretSourceKind::default(),
            env_prefix: default_env_prefix(),
            dir: default_secrets_dir(),
            vault: VaultConfig::default(),
        }
    }
}

enum Source {
    Env {
        prefix: String,
    },
    File {
        dir: PathBuf,
    },
    Vault {
        config: VaultConfig,
        http: reqwest::Client,
        data: OnceCell<HashMap<String, String>>,
    },
}

/// Resolves named secrets from the configured source, decrypting
/// `enc:` envelopes with the keyring.
pub struct SecretsProvider {
    source: Source,
    keyring: Option<Keyring>,
}

impl SecretsProvider {
    /// Build a provider from configuration. The keyring is read from
    /// `SKYRELAY_SECRETS_KEY` when present.
    pub fn from_config(config: &SecretsConfig) -> Result<Self> {
        let keyring = Keyring::from_env()?;
        Self::with_keyring(config, keyring)
    }

    pub fn with_keyring(config: &SecretsConfig, keyring: Option<Keyring>) -> Result<Self> {
        let source = match config.source {
            SecretSourceKind::Env => Source::Env {
                prefix: config.env_prefix.clone(),
            },
            SecretSourceKind::File => Source::File {
                dir: config.dir.clone(),
            },
            SecretSourceKind::Vault => {
                if config.vault.token.is_empty() {
                    return Err(ConfigError::validation(
                        "secrets.vault.token is required when secrets.source = \"vault\"",
                    ));
                }
                let http = reqwest::Client::builder()
                    .timeout(Duration::from_millis(config.vault.timeout_ms))
                    .build()
                    .map_err(|e| ConfigError::source("vault", e.to_string()))?;
                Source::Vault {
                    config: config.vault.clone(),
                    http,
                    data: OnceCell::new(),
                }
            }
        };

        Ok(Self { source, keyring })
    }

    /// Environment-backed provider without a keyring.
    pub fn env(prefix: impl Into<String>) -> Self {
        Self {
            source: Source::Env {
                prefix: prefix.into(),
            },
            keyring: None,
        }
    }

    pub fn source_kind(&self) -> SecretSourceKind {
        match self.source {
            Source::Env { .. } => SecretSourceKind::Env,
            Source::File { .. } => SecretSourceKind::File,
            Source::Vault { .. } => SecretSourceKind::Vault,
        }
    }

    pub fn keyring(&self) -> Option<&Keyring> {
        self.keyring.as_ref()
    }

    /// Look up a secret by name. Missing secrets are `Ok(None)`.
    pub async fn get(&self, name: &str) -> Result<Option<SecretString>> {
        let raw = match &self.source {
            Source::Env { prefix } => read_env(&format!("{prefix}{}", name.to_ascii_uppercase()))?,
            Source::File { dir } => read_file(dir, name).await?,
            Source::Vault { config, http, data } => {
                let data = data
                    .get_or_try_init(|| fetch_vault(http, config))
                    .await?;
                data.get(&name.to_ascii_lowercase()).cloned()
            }
        };

        match raw {
            Some(value) if !value.is_empty() => self.decode(&value).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Resolve `current` if already set, otherwise look the secret up.
    pub async fn fill(&self, current: &mut String, name: &str) -> Result<()> {
        if !current.is_empty() {
            *current = self.decode(current).await?.into_inner();
            return Ok(());
        }
        if let Some(secret) = self.get(name).await? {
            tracing::debug!(secret = name, source = ?self.source_kind(), "Resolved secret");
            *current = secret.into_inner();
        }
        Ok(())
    }

    /// Decrypt an `enc:` envelope, or pass a plain value through.
    pub async fn decode(&self, raw: &str) -> Result<SecretString> {
        match SecretValue::parse(raw)? {
            None => Ok(SecretString::new(raw)),
            Some(envelope) => {
                let keyring = self.keyring.as_ref().ok_or_else(|| {
                    ConfigError::encryption(
                        "Encrypted secret found but SKYRELAY_SECRETS_KEY is not set",
                    )
                })?;
                keyring.decrypt(&envelope).await.map(SecretString::new)
            }
        }
    }
}

impl std::fmt::Debug for SecretsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsProvider")
            .field("source", &self.source_kind())
            .field("keyring", &self.keyring)
            .finish()
    }
}

fn read_env(var: &str) -> Result<Option<String>> {
    match std::env::var(var) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::source("env", format!("{var}: {e}"))),
    }
}

async fn read_file(dir: &std::path::Path, name: &str) -> Result<Option<String>> {
    let path = dir.join(name.to_ascii_lowercase());
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(Some(contents.trim_end_matches(['\r', '\n']).to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

#[derive(Deserialize)]
struct VaultResponse {
    data: VaultData,
}

#[derive(Deserialize)]
struct VaultData {
    data: HashMap<String, serde_json::Value>,
}

async fn fetch_vault(
    http: &reqwest::Client,
    config: &VaultConfig,
) -> Result<HashMap<String, String>> {
    let url = format!(
        "{}/v1/{}/data/{}",
        config.addr.trim_end_matches('/'),
        config.mount.trim_matches('/'),
        config.path.trim_matches('/')
    );

    tracing::debug!(url = %url, "Fetching secrets from Vault");

    let response = http
        .get(&url)
        .header("X-Vault-Token", &config.token)
        .send()
        .await
        .map_err(|e| ConfigError::source("vault", e.to_string()))?;

    if !response.status().is_success() {
        return Err(ConfigError::source(
            "vault",
            format!("HTTP status {}", response.status().as_u16()),
        ));
    }

    let body: VaultResponse = response
        .json()
        .await
        .map_err(|e| ConfigError::source("vault", format!("Invalid response: {e}")))?;

    Ok(body
        .data
        .data
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k.to_ascii_lowercase(), value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_file_source_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("redis_password"), "s3cret\n").unwrap();

        let config = SecretsConfig {
            source: SecretSourceKind::File,
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let provider = SecretsProvider::with_keyring(&config, None).unwrap();

        let secret = provider.get(names::REDIS_PASSWORD).await.unwrap().unwrap();
        assert_eq!(secret.expose(), "s3cret");
        assert!(provider.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_env_source_with_encrypted_value() {
        let key = Keyring::generate_key();
        let keyring = Keyring::new(key, "primary");
        let envelope = keyring.encrypt("client-secret").await.unwrap().encode();

        unsafe {
            std::env::set_var("SKYRELAY_TEST_SOURCES_OAUTH_CLIENT_SECRET", &envelope);
        }

        let config = SecretsConfig {
            env_prefix: "SKYRELAY_TEST_SOURCES_".to_string(),
            ..Default::default()
        };
        let provider = SecretsProvider::with_keyring(&config, Some(keyring)).unwrap();
        let secret = provider
            .get(names::OAUTH_CLIENT_SECRET)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secret.expose(), "client-secret");

        unsafe {
            std::env::remove_var("SKYRELAY_TEST_SOURCES_OAUTH_CLIENT_SECRET");
        }
    }

    #[tokio::test]
    async fn test_encrypted_value_without_keyring_fails() {
        let key = Keyring::generate_key();
        let envelope = SecretValue::encrypt("x", &key, "primary").unwrap().encode();

        let provider = SecretsProvider::env("SKYRELAY_UNUSED_");
        assert!(provider.decode(&envelope).await.is_err());
        assert_eq!(provider.decode("plain").await.unwrap().expose(), "plain");
    }

    #[tokio::test]
    async fn test_fill_keeps_configured_value() {
        let provider = SecretsProvider::env("SKYRELAY_FILL_TEST_");
        let mut configured = "from-config".to_string();
        provider.fill(&mut configured, "ANYTHING").await.unwrap();
        assert_eq!(configured, "from-config");

        let mut empty = String::new();
        provider.fill(&mut empty, "NOT_SET_ANYWHERE").await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_vault_source_fetches_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/skyrelay"))
            .and(header("X-Vault-Token", "root"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "data": {
                        "redis_password": "from-vault",
                        "airport_api_key": "abc123"
                    },
                    "metadata": { "version": 3 }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = SecretsConfig {
            source: SecretSourceKind::Vault,
            vault: VaultConfig {
                addr: server.uri(),
                token: "root".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let provider = SecretsProvider::with_keyring(&config, None).unwrap();

        let password = provider.get(names::REDIS_PASSWORD).await.unwrap().unwrap();
        let api_key = provider.get(names::AIRPORT_API_KEY).await.unwrap().unwrap();
        assert_eq!(password.expose(), "from-vault");
        assert_eq!(api_key.expose(), "abc123");
    }

    #[test]
    fn test_vault_requires_token() {
        let config = SecretsConfig {
            source: SecretSourceKind::Vault,
            ..Default::default()
        };
        assert!(SecretsProvider::with_keyring(&config, None).is_err());
    }
}
