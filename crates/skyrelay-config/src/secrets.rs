//! Secret value encryption using AES-256-GCM
//!
//! Secrets may be stored at rest (in env files, mounted files or a vault) in
//! an encrypted envelope `enc:<key_id>:<nonce_b64>:<ciphertext_b64>`. The
//! [`Keyring`] holds the keys able to open those envelopes.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::ConfigError;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits)
pub const KEY_SIZE: usize = 32;

/// Prefix marking an encrypted envelope
pub const ENCRYPTED_PREFIX: &str = "enc:";

/// Environment variable holding the primary encryption key (hex or base64)
pub const KEY_ENV_VAR: &str = "SKYRELAY_SECRETS_KEY";

/// A resolved secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An encrypted secret value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretValue {
    /// Base64-encoded ciphertext
    pub ciphertext: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Key identifier for key rotation support
    pub key_id: String,
}

impl SecretValue {
    /// Encrypt a plaintext value
    pub fn encrypt(
        plaintext: &str,
        key: &[u8; KEY_SIZE],
        key_id: &str,
    ) -> Result<Self, ConfigError> {
        if key_id.contains(':') {
            return Err(ConfigError::encryption("Key id must not contain ':'"));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ConfigError::encryption(format!("Failed to create cipher: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ConfigError::encryption(format!("Encryption failed: {e}")))?;

        Ok(Self {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(nonce_bytes),
            key_id: key_id.to_string(),
        })
    }

    /// Decrypt the value
    pub fn decrypt(&self, key: &[u8; KEY_SIZE]) -> Result<String, ConfigError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ConfigError::encryption(format!("Failed to create cipher: {e}")))?;

        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| ConfigError::encryption(format!("Invalid ciphertext base64: {e}")))?;

        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| ConfigError::encryption(format!("Invalid nonce base64: {e}")))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(ConfigError::encryption("Invalid nonce size"));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| ConfigError::encryption(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| ConfigError::encryption(format!("Invalid UTF-8 in decrypted value: {e}")))
    }

    /// Render the envelope form stored at rest.
    pub fn encode(&self) -> String {
        format!(
            "{ENCRYPTED_PREFIX}{}:{}:{}",
            self.key_id, self.nonce, self.ciphertext
        )
    }

    /// Parse an envelope. Returns `Ok(None)` for plain (unencrypted) strings.
    pub fn parse(raw: &str) -> Result<Option<Self>, ConfigError> {
        let Some(body) = raw.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(None);
        };

        let mut parts = body.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key_id), Some(nonce), Some(ciphertext))
                if !key_id.is_empty() && !nonce.is_empty() && !ciphertext.is_empty() =>
            {
                Ok(Some(Self {
                    key_id: key_id.to_string(),
                    nonce: nonce.to_string(),
                    ciphertext: ciphertext.to_string(),
                }))
            }
            _ => Err(ConfigError::encryption(
                "Malformed encrypted secret, expected enc:<key_id>:<nonce>:<ciphertext>",
            )),
        }
    }
}

/// Key entry in the keyring
#[derive(Clone)]
struct KeyEntry {
    key: [u8; KEY_SIZE],
    added_at: time::OffsetDateTime,
}

/// Encryption keys with rotation support
#[derive(Clone)]
pub struct Keyring {
    current_key_id: String,
    keys: Arc<RwLock<HashMap<String, KeyEntry>>>,
}

impl Keyring {
    /// Load the primary key from `SKYRELAY_SECRETS_KEY`, if set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var(KEY_ENV_VAR) {
            Ok(key_str) => {
                let key = Self::parse_key(&key_str)?;
                Ok(Some(Self::new(key, "primary")))
            }
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::encryption(format!(
                "Failed to read {KEY_ENV_VAR}: {e}"
            ))),
        }
    }

    pub fn new(key: [u8; KEY_SIZE], key_id: &str) -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            key_id.to_string(),
            KeyEntry {
                key,
                added_at: time::OffsetDateTime::now_utc(),
            },
        );

        Self {
            current_key_id: key_id.to_string(),
            keys: Arc::new(RwLock::new(keys)),
        }
    }

    /// Parse a key from a hex or base64 string
    pub fn parse_key(key_str: &str) -> Result<[u8; KEY_SIZE], ConfigError> {
        let key_str = key_str.trim();

        if key_str.len() == KEY_SIZE * 2
            && let Ok(bytes) = hex::decode(key_str)
        {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }

        let bytes = BASE64
            .decode(key_str)
            .map_err(|e| ConfigError::encryption(format!("Invalid base64 key: {e}")))?;

        if bytes.len() != KEY_SIZE {
            return Err(ConfigError::encryption(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    /// Generate a new random key
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    pub fn current_key_id(&self) -> &str {
        &self.current_key_id
    }

    /// Encrypt a value with the current key
    pub async fn encrypt(&self, plaintext: &str) -> Result<SecretValue, ConfigError> {
        let keys = self.keys.read().await;
        let entry = keys.get(&self.current_key_id).ok_or_else(|| {
            ConfigError::encryption(format!("Current key '{}' not found", self.current_key_id))
        })?;

        SecretValue::encrypt(plaintext, &entry.key, &self.current_key_id)
    }

    pub async fn decrypt(&self, secret: &SecretValue) -> Result<String, ConfigError> {
        let keys = self.keys.read().await;
        let entry = keys.get(&secret.key_id).ok_or_else(|| {
            ConfigError::encryption(format!("Key '{}' not found in keyring", secret.key_id))
        })?;

        secret.decrypt(&entry.key)
    }

    /// Add an older key so values encrypted before a rotation still open.
    pub async fn add_key(&self, key: [u8; KEY_SIZE], key_id: &str) {
        let mut keys = self.keys.write().await;
        keys.insert(
            key_id.to_string(),
            KeyEntry {
                key,
                added_at: time::OffsetDateTime::now_utc(),
            },
        );
        tracing::debug!(key_id, "Added key to secrets keyring");
    }

    pub async fn remove_key(&self, key_id: &str) -> Result<(), ConfigError> {
        if key_id == self.current_key_id {
            return Err(ConfigError::encryption("Cannot remove the current key"));
        }

        let mut keys = self.keys.write().await;
        keys.remove(key_id);
        Ok(())
    }

    /// Key ids with the time each was added, oldest first.
    pub async fn key_ids(&self) -> Vec<(String, time::OffsetDateTime)> {
        let keys = self.keys.read().await;
        let mut ids: Vec<_> = keys
            .iter()
            .map(|(id, entry)| (id.clone(), entry.added_at))
            .collect();
        ids.sort_by_key(|(_, added_at)| *added_at);
        ids
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("current_key_id", &self.current_key_id)
            .field("keys", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = Keyring::generate_key();
        let plaintext = "redis-password";

        let secret = SecretValue::encrypt(plaintext, &key, "test-key").unwrap();
        assert_ne!(secret.ciphertext, plaintext);

        let decrypted = secret.decrypt(&key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = Keyring::generate_key();
        let key2 = Keyring::generate_key();

        let secret = SecretValue::encrypt("secret", &key1, "key1").unwrap();
        assert!(secret.decrypt(&key2).is_err());
    }

    #[test]
    fn test_envelope_parse() {
        let key = Keyring::generate_key();
        let secret = SecretValue::encrypt("client-secret", &key, "primary").unwrap();

        let encoded = secret.encode();
        assert!(encoded.starts_with("enc:primary:"));

        let parsed = SecretValue::parse(&encoded).unwrap().unwrap();
        assert_eq!(parsed, secret);
        assert_eq!(parsed.decrypt(&key).unwrap(), "client-secret");
    }

    #[test]
    fn test_plain_value_is_not_an_envelope() {
        assert!(SecretValue::parse("hunter2").unwrap().is_none());
        assert!(SecretValue::parse("enc:only-key-id").is_err());
    }

    #[test]
    fn test_parse_key_hex_and_base64() {
        let key = Keyring::generate_key();
        assert_eq!(Keyring::parse_key(&hex::encode(key)).unwrap(), key);
        assert_eq!(Keyring::parse_key(&BASE64.encode(key)).unwrap(), key);
        assert!(Keyring::parse_key("too-short").is_err());
    }

    #[test]
    fn test_secret_string_debug_is_redacted() {
        let secret = SecretString::new("p@ssw0rd");
        assert!(!format!("{secret:?}").contains("p@ssw0rd"));
        assert_eq!(secret.expose(), "p@ssw0rd");
    }

    #[tokio::test]
    async fn test_keyring_rotation() {
        let old_key = Keyring::generate_key();
        let old = SecretValue::encrypt("legacy", &old_key, "old").unwrap();

        let keyring = Keyring::new(Keyring::generate_key(), "primary");
        assert!(keyring.decrypt(&old).await.is_err());

        keyring.add_key(old_key, "old").await;
        assert_eq!(keyring.decrypt(&old).await.unwrap(), "legacy");

        let fresh = keyring.encrypt("fresh").await.unwrap();
        assert_eq!(fresh.key_id, "primary");
        assert!(keyring.remove_key("primary").await.is_err());
        keyring.remove_key("old").await.unwrap();
        assert_eq!(keyring.key_ids().await.len(), 1);
    }
}
