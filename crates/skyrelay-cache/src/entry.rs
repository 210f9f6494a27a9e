//! Typed cache entries and the envelope stored in both tiers.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;

/// Which tier served an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Shared,
    Local,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Shared => write!(f, "shared"),
            CacheSource::Local => write!(f, "local"),
        }
    }
}

/// A cached payload with provenance.
///
/// `expires_at` is always strictly after `fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub source: CacheSource,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        let left = self.expires_at - OffsetDateTime::now_utc();
        Duration::try_from(left).unwrap_or(Duration::ZERO)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            source: self.source,
            fetched_at: self.fetched_at,
            expires_at: self.expires_at,
        }
    }
}

/// Serialized form. Timestamps are unix milliseconds.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    data: T,
    fetched_at: i64,
    expires_at: i64,
}

/// Smallest TTL accepted by the cache tiers.
pub(crate) const MIN_TTL: Duration = Duration::from_millis(1);

pub(crate) fn encode<T: Serialize>(
    data: &T,
    ttl: Duration,
) -> Result<(Vec<u8>, OffsetDateTime, OffsetDateTime), StoreError> {
    let ttl = ttl.max(MIN_TTL);
    let fetched_at = OffsetDateTime::now_utc();
    let expires_at = fetched_at + ttl;

    let bytes = serde_json::to_vec(&Envelope {
        data,
        fetched_at: unix_millis(fetched_at),
        expires_at: unix_millis(expires_at),
    })
    .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok((bytes, fetched_at, expires_at))
}

pub(crate) fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    source: CacheSource,
) -> Result<CacheEntry<T>, StoreError> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(CacheEntry {
        data: envelope.data,
        source,
        fetched_at: from_unix_millis(envelope.fetched_at)?,
        expires_at: from_unix_millis(envelope.expires_at)?,
    })
}

pub(crate) fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn now_millis() -> u64 {
    unix_millis(OffsetDateTime::now_utc()).max(0) as u64
}

pub(crate) fn from_unix_millis(ms: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| StoreError::Serialization(format!("invalid timestamp {ms}: {e}")))
}
