//! Process-local [`SharedStore`].
//!
//! Honors the same contract as Redis (strings, hashes, sorted sets, TTLs) so
//! single-node deployments can run without a server. `set_offline` makes
//! every call fail, which is how tests simulate a backend outage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SharedStore, SlidingWindowCount, StoreResult};
use crate::error::StoreError;
use crate::key::glob_matcher;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    /// member -> score
    SortedSet(BTreeMap<String, u64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, Slot>>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Operations attempted, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.lock().values().filter(|slot| slot.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }

    /// Run `f` against the live slot for `key`, dropping it first if expired.
    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Slot>) -> R) -> R {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Unavailable(format!("WRONGTYPE operation against key '{key}'"))
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        self.with_live(key, |slot| match slot.map(|s| &s.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.data.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .data
            .lock()
            .remove(key)
            .is_some_and(|slot| slot.is_live(now)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.with_live(key, |slot| slot.is_some()))
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        self.check()?;
        let Some(matcher) = glob_matcher(pattern) else {
            return Ok(0);
        };
        let now = Instant::now();
        let mut data = self.data.lock();
        let before = data.len();
        let mut expired = 0u64;
        data.retain(|key, slot| {
            if !matcher.is_match(key) {
                return true;
            }
            if !slot.is_live(now) {
                expired += 1;
            }
            false
        });
        Ok((before - data.len()) as u64 - expired)
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
            data.remove(key);
        }
        let slot = data.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(hash) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| {
                    StoreError::Unavailable(format!("hash value '{field}' is not an integer"))
                })?,
            None => 0,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        self.with_live(key, |slot| match slot.map(|s| &s.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
            data.remove(key);
        }
        let slot = data.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(hash) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value.as_bytes().to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        let matches = data.get(key).is_some_and(|slot| {
            slot.is_live(now)
                && matches!(
                    &slot.value,
                    Value::Bytes(bytes) if bytes.as_slice() == expected.as_bytes()
                )
        });
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        let current = match data.get(key).filter(|slot| slot.is_live(now)).map(|s| &s.value) {
            None => 0,
            Some(Value::Bytes(bytes)) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    StoreError::Unavailable(format!("value at '{key}' is not an integer"))
                })?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + 1;
        data.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(next.to_string().into_bytes()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(next)
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        member: &str,
        window: Duration,
    ) -> StoreResult<SlidingWindowCount> {
        self.check()?;
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
            data.remove(key);
        }
        let slot = data.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::SortedSet(BTreeMap::new()),
            expires_at: None,
        });
        let Value::SortedSet(events) = &mut slot.value else {
            return Err(wrong_type(key));
        };

        events.retain(|_, score| *score > cutoff);
        events.insert(member.to_string(), now_ms);

        let count = events.len() as u64;
        let oldest_ms = events.values().min().copied();
        slot.expires_at = Some(now + window);

        Ok(SlidingWindowCount { count, oldest_ms })
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_strings_with_ttl() {
        let store = InMemoryStore::new();
        store.set_ex("k", b"v", Duration::from_millis(30)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_and_compare_and_delete() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.set_nx_ex("lock", "a", ttl).await.unwrap());
        assert!(!store.set_nx_ex("lock", "b", ttl).await.unwrap());

        assert!(!store.compare_and_delete("lock", "b").await.unwrap());
        assert!(store.exists("lock").await.unwrap());
        assert!(store.compare_and_delete("lock", "a").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_counters() {
        let store = InMemoryStore::new();
        assert_eq!(store.hincr("stats", "hits", 1).await.unwrap(), 1);
        assert_eq!(store.hincr("stats", "hits", 2).await.unwrap(), 3);
        store.hset("stats", "last_reset", "0").await.unwrap();
        let all = store.hgetall("stats").await.unwrap();
        assert_eq!(all.get("hits").map(String::as_str), Some("3"));
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(5);
        store.set_ex("p:airport:KJFK", b"1", ttl).await.unwrap();
        store.set_ex("p:airport:EGLL", b"1", ttl).await.unwrap();
        store.set_ex("p:track:abc", b"1", ttl).await.unwrap();
        assert_eq!(store.delete_matching("p:airport:*").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_incr_with_expiry() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(5);
        assert_eq!(store.incr_with_expiry("w", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("w", ttl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sliding_window_prunes_old_events() {
        let store = InMemoryStore::new();
        let window = Duration::from_millis(1000);
        store.sliding_window("s", 1_000, "a", window).await.unwrap();
        store.sliding_window("s", 1_500, "b", window).await.unwrap();
        let step = store.sliding_window("s", 2_100, "c", window).await.unwrap();
        assert_eq!(step.count, 2);
        assert_eq!(step.oldest_ms, Some(1_500));
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
        assert_eq!(store.calls(), 3);
    }
}
