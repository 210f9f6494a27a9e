//! Secret resolution for skyrelay.
//!
//! Credentials the resilience layer needs (cache backend password, TLS key
//! material, upstream API keys, OAuth2 client secrets) are resolved through a
//! [`SecretsProvider`] instead of being read ad hoc from the environment.
//!
//! # Sources
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               SecretsProvider                │
//! │  ┌─────────┐   ┌──────────┐   ┌──────────┐   │
//! │  │   Env   │   │   File   │   │  Vault   │   │
//! │  └────┬────┘   └────┬─────┘   └────┬─────┘   │
//! │       └─────────────┼──────────────┘         │
//! │                     │                        │
//! │               ┌─────▼─────┐                  │
//! │               │  Keyring  │ (enc:… values)   │
//! │               └─────┬─────┘                  │
//! └─────────────────────┼────────────────────────┘
//!                       ▼
//!                 SecretString
//! ```
//!
//! Values stored as `enc:<key_id>:<nonce>:<ciphertext>` are decrypted with
//! AES-256-GCM using the keyring loaded from `SKYRELAY_SECRETS_KEY`.

pub mod secrets;
pub mod sources;

pub use secrets::{Keyring, SecretString, SecretValue};
pub use sources::{SecretSourceKind, SecretsConfig, SecretsProvider, VaultConfig};

/// Error types for secret resolution
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Secret source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },
}

impl ConfigError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Result type for secret operations
pub type Result<T> = std::result::Result<T, ConfigError>;
