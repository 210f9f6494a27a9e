//! Bounded, process-local cache tier.
//!
//! Always available and never fails. Entries are kept in insertion order so
//! the oldest one is evicted when `max_entries` is reached; rewriting a key
//! moves it to the back. Expiry is lazy on read, plus an optional periodic
//! sweep ([`LocalCacheStore::spawn_janitor`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::key::glob_matcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Seconds between expiry sweeps
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_janitor_interval_secs() -> u64 {
    60
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            janitor_interval_secs: default_janitor_interval_secs(),
        }
    }
}

/// Local tier statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalStoreStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to make room
    pub evictions: u64,
    /// Entries dropped because their TTL ran out
    pub expirations: u64,
}

struct LocalEntry {
    data: Arc<Vec<u8>>,
    expires_at: Instant,
}

pub struct LocalCacheStore {
    entries: Mutex<IndexMap<String, LocalEntry>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalCacheStore {
    pub fn new(config: &LocalCacheConfig) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Returns `None` for missing or expired keys.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.data))
            }
            Some(_) => {
                entries.shift_remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) {
        let entry = LocalEntry {
            data: Arc::new(data),
            expires_at: Instant::now() + ttl,
        };

        let mut entries = self.entries.lock();
        // Re-inserting must move the key to the back of the eviction order.
        entries.shift_remove(key);

        while entries.len() >= self.max_entries {
            let Some((evicted, _)) = entries.shift_remove_index(0) else {
                break;
            };
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %evicted, "local cache eviction");
        }

        entries.insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .shift_remove(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Time left on a live entry.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .and_then(|entry| entry.expires_at.checked_duration_since(now))
            .filter(|left| !left.is_zero())
    }

    /// Delete every live key matching a `*` glob.
    pub fn delete_matching(&self, pattern: &str) -> u64 {
        let Some(matcher) = glob_matcher(pattern) else {
            return 0;
        };
        let now = Instant::now();
        let mut removed = 0;
        self.entries.lock().retain(|key, entry| {
            if matcher.is_match(key) {
                if entry.expires_at > now {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.lock().retain(|_, entry| {
            if entry.expires_at <= now {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }

        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LocalStoreStats {
        LocalStoreStats {
            size: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Sweep expired entries every `interval` until `shutdown` is cancelled.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("local cache janitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = store.len(), "local cache sweep");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_entries: usize) -> LocalCacheStore {
        LocalCacheStore::new(&LocalCacheConfig {
            max_entries,
            ..Default::default()
        })
    }

    #[test]
    fn test_get_and_set() {
        let cache = store(10);
        cache.set("a", b"1".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get("a").as_deref(), Some(&b"1".to_vec()));
        assert!(cache.get("b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let cache = store(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", vec![1], ttl);
        cache.set("b", vec![2], ttl);
        // Refresh "a" so "b" becomes the oldest.
        cache.set("a", vec![3], ttl);
        cache.set("c", vec![4], ttl);

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lazy_expiry() {
        let cache = store(10);
        cache.set("a", vec![1], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.exists("a"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_delete_matching() {
        let cache = store(10);
        let ttl = Duration::from_secs(60);
        cache.set("skyrelay:airport:KJFK", vec![1], ttl);
        cache.set("skyrelay:airport:EGLL", vec![1], ttl);
        cache.set("skyrelay:track:3c6444", vec![1], ttl);

        assert_eq!(cache.delete_matching("skyrelay:airport:*"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.delete_matching("skyrelay:*"), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remaining_ttl() {
        let cache = store(10);
        cache.set("a", vec![1], Duration::from_secs(30));
        let left = cache.remaining_ttl("a").unwrap();
        assert!(left <= Duration::from_secs(30) && left > Duration::from_secs(29));
        assert!(cache.remaining_ttl("missing").is_none());
    }

    #[tokio::test]
    async fn test_janitor_sweeps_and_stops() {
        let cache = Arc::new(store(10));
        cache.set("short", vec![1], Duration::from_millis(5));
        cache.set("long", vec![1], Duration::from_secs(60));

        let shutdown = CancellationToken::new();
        let handle = cache.spawn_janitor(Duration::from_millis(20), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
