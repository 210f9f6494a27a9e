//! Error taxonomy.
//!
//! [`StoreError`] lives at the shared-store edge and is absorbed by the
//! components that fall back to local state. [`Error`] is what callers see.
//! Both are `Clone` so single-flight followers can receive the leader's error.

use std::time::Duration;

/// Failure talking to the shared store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    #[error("shared store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        StoreError::Unavailable(format!("connection pool: {e}"))
    }
}

impl From<crate::breaker::CircuitOpenError> for StoreError {
    fn from(e: crate::breaker::CircuitOpenError) -> Self {
        StoreError::CircuitOpen(e.name)
    }
}

/// Failure reported by an upstream HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("upstream requires authentication (status {status})")]
    AuthRequired { status: u16 },

    #[error("upstream rate limit reached")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("upstream server error (status {status})")]
    Server { status: u16 },

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, resource: &str, retry_after_seconds: Option<u64>) -> Self {
        match status {
            404 => UpstreamError::NotFound {
                resource: resource.to_string(),
            },
            401 | 403 => UpstreamError::AuthRequired { status },
            429 => UpstreamError::RateLimited {
                retry_after_seconds,
            },
            400 | 422 => {
                UpstreamError::InvalidRequest(format!("{resource} rejected (status {status})"))
            }
            _ => UpstreamError::Server { status },
        }
    }

    /// Transport failures and 5xx responses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(_) => true,
            UpstreamError::Server { status } => *status >= 500,
            _ => false,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::NotFound { .. } => 404,
            UpstreamError::AuthRequired { .. } => 401,
            UpstreamError::RateLimited { .. } => 429,
            UpstreamError::InvalidRequest(_) => 400,
            UpstreamError::Server { .. } | UpstreamError::Decode(_) => 502,
            UpstreamError::Transport(_) => 504,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::Server {
                status: status.as_u16(),
            }
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// Caller-facing error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("shared cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("rate limit exceeded for '{key}', retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        key: String,
        retry_after_seconds: u64,
    },

    #[error("could not acquire lock '{key}'")]
    LockAcquisitionFailed { key: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("token fetch failed: {0}")]
    TokenFetchFailed(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BackendUnavailable(_) | Error::CircuitOpen => 503,
            Error::LockAcquisitionFailed { .. } => 503,
            Error::Upstream(e) => e.status_code(),
            Error::RateLimitExceeded { .. } => 429,
            Error::AuthenticationRequired(_) => 401,
            Error::TokenFetchFailed(_) => 502,
            Error::InvalidPattern(_) => 400,
            Error::Serialization(_) | Error::Internal(_) => 500,
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Error::RateLimitExceeded {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            Error::Upstream(UpstreamError::RateLimited {
                retry_after_seconds,
            }) => *retry_after_seconds,
            _ => None,
        }
    }

    /// Whether a retry with backoff could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Upstream(e) => e.is_retryable(),
            Error::BackendUnavailable(_) | Error::TokenFetchFailed(_) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CircuitOpen(_) => Error::CircuitOpen,
            StoreError::Serialization(msg) => Error::Serialization(msg),
            other => Error::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_classification() {
        assert!(matches!(
            UpstreamError::from_status(404, "airport KJFK", None),
            UpstreamError::NotFound { .. }
        ));
        assert!(matches!(
            UpstreamError::from_status(401, "states", None),
            UpstreamError::AuthRequired { status: 401 }
        ));
        assert_eq!(
            UpstreamError::from_status(429, "states", Some(7)),
            UpstreamError::RateLimited {
                retry_after_seconds: Some(7)
            }
        );
        assert_eq!(
            UpstreamError::from_status(503, "states", None),
            UpstreamError::Server { status: 503 }
        );
    }

    #[test]
    fn test_status_codes() {
        let err = Error::RateLimitExceeded {
            key: "flights".into(),
            retry_after_seconds: 3,
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.retry_after_seconds(), Some(3));

        let err: Error = UpstreamError::NotFound {
            resource: "airport".into(),
        }
        .into();
        assert_eq!(err.status_code(), 404);
        assert!(!err.is_retryable());

        let err: Error = UpstreamError::Server { status: 502 }.into();
        assert!(err.is_retryable());

        assert_eq!(Error::AuthenticationRequired("x".into()).status_code(), 401);
        assert_eq!(Error::InvalidPattern("lock".into()).status_code(), 400);
    }

    #[test]
    fn test_store_error_conversion() {
        let err: Error = StoreError::CircuitOpen("redis".into()).into();
        assert!(matches!(err, Error::CircuitOpen));

        let err: Error = StoreError::Timeout(Duration::from_millis(5)).into();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }
}
