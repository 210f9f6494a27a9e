//! Two-level cache: shared tier (behind the circuit breaker) + local tier.
//!
//! ## Lookup Order
//!
//! 1. Shared store, unless absent or its circuit is open
//! 2. Local store
//!
//! A shared hit is copied into the local tier with its remaining TTL so a
//! later outage still serves recently read data.
//!
//! ## Write Strategy
//!
//! Writes always land in the local tier first, then the shared tier when
//! reachable. Shared failures are logged and absorbed; nothing in this module
//! surfaces backend unavailability to callers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::entry::{self, CacheEntry, CacheSource};
use crate::error::{Error, Result, StoreError};
use crate::key::{CacheKey, KeySpace};
use crate::local::LocalCacheStore;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::store::GuardedStore;

/// One backend tier, tried in order.
#[derive(Clone, Copy)]
enum Tier<'a> {
    Shared(&'a GuardedStore),
    Local(&'a LocalCacheStore),
}

impl Tier<'_> {
    fn source(&self) -> CacheSource {
        match self {
            Tier::Shared(_) => CacheSource::Shared,
            Tier::Local(_) => CacheSource::Local,
        }
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<Arc<Vec<u8>>>, StoreError> {
        match self {
            Tier::Shared(store) => Ok(store.get(key).await?.map(Arc::new)),
            Tier::Local(store) => Ok(store.get(key)),
        }
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
        match self {
            Tier::Shared(store) => store.exists(key).await,
            Tier::Local(store) => Ok(store.exists(key)),
        }
    }
}

#[derive(Clone)]
pub struct TwoLevelCache {
    shared: Option<GuardedStore>,
    local: Arc<LocalCacheStore>,
    keys: KeySpace,
    stats: CacheStats,
}

impl TwoLevelCache {
    pub fn new(shared: Option<GuardedStore>, local: Arc<LocalCacheStore>, keys: KeySpace) -> Self {
        let stats = CacheStats::new(shared.clone(), keys.clone());
        Self {
            shared,
            local,
            keys,
            stats,
        }
    }

    /// Local tier only.
    pub fn local_only(local: Arc<LocalCacheStore>, keys: KeySpace) -> Self {
        Self::new(None, local, keys)
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn local(&self) -> &Arc<LocalCacheStore> {
        &self.local
    }

    pub fn shared(&self) -> Option<&GuardedStore> {
        self.shared.as_ref()
    }

    /// Whether the shared tier is configured and its circuit admits calls.
    pub fn is_shared_available(&self) -> bool {
        self.shared.as_ref().is_some_and(GuardedStore::is_available)
    }

    /// `"shared"` when a shared tier is configured, `"local"` otherwise.
    pub fn mode(&self) -> &'static str {
        if self.shared.is_some() { "shared" } else { "local" }
    }

    /// Tiers a read walks through, in order.
    fn tiers(&self) -> Vec<Tier<'_>> {
        let mut tiers = Vec::with_capacity(2);
        if let Some(shared) = self.shared.as_ref().filter(|s| s.is_available()) {
            tiers.push(Tier::Shared(shared));
        }
        tiers.push(Tier::Local(&self.local));
        tiers
    }

    /// Look a key up. Misses, backend failures and undecodable payloads all
    /// yield `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let backend_key = self.keys.key(key);
        let namespace = key.namespace();

        for tier in self.tiers() {
            let bytes = match tier.get(&backend_key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        key = %backend_key,
                        error = %e,
                        "shared cache read failed, falling back"
                    );
                    crate::metrics::record_backend_error("get");
                    self.stats.record_error(namespace);
                    continue;
                }
            };

            let entry = match entry::decode::<T>(&bytes, tier.source()) {
                Ok(entry) if !entry.is_expired() => entry,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(
                        key = %backend_key,
                        error = %e,
                        "discarding undecodable cache entry"
                    );
                    continue;
                }
            };

            if matches!(tier, Tier::Shared(_)) {
                let ttl = entry.remaining_ttl();
                if !ttl.is_zero() {
                    self.local.set(&backend_key, bytes.as_ref().clone(), ttl);
                }
            }

            tracing::debug!(key = %backend_key, source = %entry.source, "cache hit");
            crate::metrics::record_cache_hit(namespace, match entry.source {
                CacheSource::Shared => "shared",
                CacheSource::Local => "local",
            });
            self.stats.record_hit(namespace);
            return Some(entry);
        }

        tracing::debug!(key = %backend_key, "cache miss");
        crate::metrics::record_cache_miss(namespace);
        self.stats.record_miss(namespace);
        None
    }

    /// Store a value in both tiers.
    ///
    /// Only serialization can fail; a shared-tier failure is logged and the
    /// local write stands.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> Result<CacheEntry<()>> {
        let backend_key = self.keys.key(key);
        let (bytes, fetched_at, expires_at) = entry::encode(value, ttl)?;
        let ttl = ttl.max(entry::MIN_TTL);

        self.local.set(&backend_key, bytes.clone(), ttl);

        let mut source = CacheSource::Local;
        if let Some(shared) = self.shared.as_ref().filter(|s| s.is_available()) {
            match shared.set_ex(&backend_key, &bytes, ttl).await {
                Ok(()) => source = CacheSource::Shared,
                Err(e) => {
                    tracing::warn!(
                        key = %backend_key,
                        error = %e,
                        "shared cache write failed, kept local copy"
                    );
                    crate::metrics::record_backend_error("set");
                    self.stats.record_error(key.namespace());
                }
            }
        }

        tracing::debug!(
            key = %backend_key,
            ttl_ms = ttl.as_millis() as u64,
            source = %source,
            "cache set"
        );
        Ok(CacheEntry {
            data: (),
            source,
            fetched_at,
            expires_at,
        })
    }

    /// Remove a key from both tiers. Returns whether any tier held it.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let backend_key = self.keys.key(key);
        let mut removed = self.local.delete(&backend_key);

        if let Some(shared) = self.shared.as_ref().filter(|s| s.is_available()) {
            match shared.delete(&backend_key).await {
                Ok(existed) => removed |= existed,
                Err(e) => {
                    tracing::warn!(key = %backend_key, error = %e, "shared cache delete failed");
                    crate::metrics::record_backend_error("delete");
                }
            }
        }

        removed
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        let backend_key = self.keys.key(key);
        for tier in self.tiers() {
            match tier.exists(&backend_key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %backend_key, error = %e, "shared cache exists failed");
                    crate::metrics::record_backend_error("exists");
                }
            }
        }
        false
    }

    /// Delete cached payloads matching `pattern` (`airport:*`), or every
    /// payload namespace when `None`. Locks, rate-limit windows, tokens and
    /// stats are out of reach; naming one of them is `InvalidPattern`.
    ///
    /// Returns the larger of the per-tier counts, since the local tier
    /// mirrors shared entries.
    pub async fn clear(&self, pattern: Option<&str>) -> Result<u64> {
        let backend_patterns = self.keys.clear_patterns(pattern).map_err(Error::InvalidPattern)?;

        let mut local_removed = 0;
        let mut shared_removed = 0;
        for backend_pattern in &backend_patterns {
            local_removed += self.local.delete_matching(backend_pattern);

            let Some(shared) = self.shared.as_ref().filter(|s| s.is_available()) else {
                continue;
            };
            match shared.delete_matching(backend_pattern).await {
                Ok(n) => shared_removed += n,
                Err(e) => {
                    tracing::warn!(
                        pattern = %backend_pattern,
                        error = %e,
                        "shared cache clear failed"
                    );
                    crate::metrics::record_backend_error("clear");
                }
            }
        }

        tracing::info!(
            patterns = ?backend_patterns,
            local_removed,
            shared_removed,
            "cache cleared"
        );
        Ok(local_removed.max(shared_removed))
    }

    pub async fn stats(&self, namespace: &str) -> StatsSnapshot {
        self.stats.snapshot(namespace).await
    }

    pub async fn reset_stats(&self, namespace: &str) {
        self.stats.reset(namespace).await
    }
}

impl std::fmt::Debug for TwoLevelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoLevelCache")
            .field("mode", &self.mode())
            .field("shared", &self.shared)
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::concurrency::{
        ConcurrencyManager, LockConfig, LockFailureMode, LockOptions, RetryConfig,
    };
    use crate::key::namespaces;
    use crate::local::LocalCacheConfig;
    use crate::store::{InMemoryStore, SharedStore};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Airport {
        iata: String,
        name: String,
    }

    fn jfk() -> Airport {
        Airport {
            iata: "JFK".into(),
            name: "John F Kennedy Intl".into(),
        }
    }

    fn cache() -> (Arc<InMemoryStore>, TwoLevelCache) {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default()));
        let local = Arc::new(LocalCacheStore::new(&LocalCacheConfig::default()));
        let cache = TwoLevelCache::new(
            Some(GuardedStore::new(store.clone(), breaker)),
            local,
            KeySpace::default(),
        );
        (store, cache)
    }

    #[tokio::test]
    async fn test_set_then_get_from_shared() {
        let (_store, cache) = cache();
        let key = CacheKey::new(namespaces::AIRPORT, "JFK");
        let written = cache.set(&key, &jfk(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(written.source, CacheSource::Shared);

        let entry = cache.get::<Airport>(&key).await.unwrap();
        assert_eq!(entry.data, jfk());
        assert_eq!(entry.source, CacheSource::Shared);
        assert!(entry.expires_at > entry.fetched_at);
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let (_store, cache) = cache();
        let key = CacheKey::new(namespaces::AIRPORT, "XXX");
        assert!(cache.get::<Airport>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_shared_hit_is_promoted_to_local() {
        let (store, cache) = cache();
        let key = CacheKey::new(namespaces::AIRPORT, "JFK");

        // Written by another instance: only the shared tier has it.
        let (bytes, _, _) = entry::encode(&jfk(), Duration::from_secs(60)).unwrap();
        store
            .set_ex(&cache.keys().key(&key), &bytes, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.local().is_empty());

        assert!(cache.get::<Airport>(&key).await.is_some());
        assert_eq!(cache.local().len(), 1);

        store.set_offline(true);
        let entry = cache.get::<Airport>(&key).await.unwrap();
        assert_eq!(entry.source, CacheSource::Local);
    }

    #[tokio::test]
    async fn test_write_survives_shared_failure() {
        let (store, cache) = cache();
        store.set_offline(true);
        let key = CacheKey::new(namespaces::AIRPORT, "JFK");

        let written = cache.set(&key, &jfk(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(written.source, CacheSource::Local);
        let entry = cache.get::<Airport>(&key).await.unwrap();
        assert_eq!(entry.source, CacheSource::Local);
        assert!(cache.exists(&key).await);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_store, cache) = cache();
        let ttl = Duration::from_secs(60);
        let jfk_key = CacheKey::new(namespaces::AIRPORT, "JFK");
        let lhr_key = CacheKey::new(namespaces::AIRPORT, "LHR");
        let track_key = CacheKey::new(namespaces::TRACK, "3c6444");
        cache.set(&jfk_key, &jfk(), ttl).await.unwrap();
        cache.set(&lhr_key, &jfk(), ttl).await.unwrap();
        cache.set(&track_key, &1u32, ttl).await.unwrap();

        assert!(cache.delete(&jfk_key).await);
        assert!(!cache.delete(&jfk_key).await);
        assert_eq!(cache.clear(Some("airport:*")).await.unwrap(), 1);
        assert!(cache.get::<u32>(&track_key).await.is_some());
        assert_eq!(cache.clear(None).await.unwrap(), 1);
        assert!(!cache.exists(&track_key).await);
    }

    #[tokio::test]
    async fn test_clear_leaves_locks_and_budgets_alone() {
        let (store, cache) = cache();
        let ttl = Duration::from_secs(60);
        let locks = ConcurrencyManager::new(
            cache.shared().cloned(),
            cache.keys().clone(),
            LockConfig::default(),
            RetryConfig::default(),
        );
        let options = LockOptions {
            ttl,
            retries: 0,
            retry_delay: Duration::from_millis(1),
            failure_mode: LockFailureMode::Closed,
        };

        let held = locks.acquire_lock("airport:JFK", &options).await;
        assert!(held.acquired);
        let budget_key = cache.keys().raw(namespaces::RATE_LIMIT, "flights:skyrelay:1");
        store.set_ex(&budget_key, b"7", ttl).await.unwrap();
        let token_key = cache.keys().raw(namespaces::TOKEN, "oauth");
        store.set_ex(&token_key, b"{}", ttl).await.unwrap();
        cache.set(&CacheKey::new(namespaces::AIRPORT, "JFK"), &jfk(), ttl).await.unwrap();

        assert_eq!(cache.clear(None).await.unwrap(), 1);
        assert_eq!(cache.clear(Some("*")).await.unwrap(), 0);

        assert!(store.exists("skyrelay:lock:airport:JFK").await.unwrap());
        assert!(store.exists(&budget_key).await.unwrap());
        assert!(store.exists(&token_key).await.unwrap());
        assert!(!locks.acquire_lock("airport:JFK", &options).await.acquired);
        assert!(locks.release_lock("airport:JFK", &held.token).await);
    }

    #[tokio::test]
    async fn test_clear_rejects_internal_namespaces() {
        let (store, cache) = cache();
        let budget_key = cache.keys().raw(namespaces::RATE_LIMIT, "flights:skyrelay:1");
        store.set_ex(&budget_key, b"7", Duration::from_secs(60)).await.unwrap();

        for pattern in ["lock:*", "ratelimit:*", "token:*", "stats"] {
            let err = cache.clear(Some(pattern)).await.unwrap_err();
            assert!(matches!(err, Error::InvalidPattern(_)), "{pattern}");
            assert_eq!(err.status_code(), 400);
        }
        assert!(store.exists(&budget_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let (_store, cache) = cache();
        let key = CacheKey::new(namespaces::FLIGHT_STATE, "abc");
        cache.set(&key, &1u32, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get::<u32>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_stats_recorded_per_namespace() {
        let cache = TwoLevelCache::local_only(
            Arc::new(LocalCacheStore::new(&LocalCacheConfig::default())),
            KeySpace::default(),
        );
        let key = CacheKey::new(namespaces::AIRPORT, "JFK");
        assert!(cache.get::<Airport>(&key).await.is_none());
        cache.set(&key, &jfk(), Duration::from_secs(60)).await.unwrap();
        assert!(cache.get::<Airport>(&key).await.is_some());

        let stats = cache.stats(namespaces::AIRPORT).await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.mode(), "local");
    }
}
