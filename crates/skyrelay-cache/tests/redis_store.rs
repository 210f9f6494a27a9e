//! Integration tests for the Redis shared store.
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyrelay_cache::{
    CacheKey, CacheSource, CircuitBreaker, CircuitBreakerConfig, ConcurrencyManager, GuardedStore,
    KeySpace, LocalCacheConfig, LocalCacheStore, LockConfig, LockOptions, RateLimitAlgorithm,
    RateLimitConfig, RateLimitRule, RateLimiter, RedisStore, RedisStoreConfig, RetryConfig,
    SharedStore, TwoLevelCache, namespaces,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn connect() -> Arc<RedisStore> {
    let config = RedisStoreConfig {
        url: get_redis_url().await,
        username: None,
        password: None,
        pool_size: 4,
        timeout_ms: 2_000,
        tls: None,
    };
    Arc::new(RedisStore::connect(&config).await.expect("connect to redis"))
}

/// Each test works under its own prefix so they can share one server.
fn keys(test: &str) -> KeySpace {
    KeySpace::new(&format!("test-{test}-{}", uuid::Uuid::new_v4().simple()))
}

fn guarded(store: Arc<RedisStore>) -> GuardedStore {
    GuardedStore::new(
        store,
        Arc::new(CircuitBreaker::new("redis", CircuitBreakerConfig::default())),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Airport {
    icao: String,
    name: String,
}

#[tokio::test]
async fn test_string_operations() {
    let store = connect().await;
    let key = format!("{}:k", keys("strings").prefix());

    store.set_ex(&key, b"value", Duration::from_secs(60)).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some(b"value".to_vec()));
    assert!(store.exists(&key).await.unwrap());
    assert!(store.delete(&key).await.unwrap());
    assert!(!store.delete(&key).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_expiry() {
    let store = connect().await;
    let key = format!("{}:short", keys("expiry").prefix());

    store.set_ex(&key, b"v", Duration::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_matching_uses_scan() {
    let store = connect().await;
    let prefix = keys("scan").prefix().to_string();

    for i in 0..1_200 {
        store
            .set_ex(&format!("{prefix}:airport:{i}"), b"1", Duration::from_secs(60))
            .await
            .unwrap();
    }
    store
        .set_ex(&format!("{prefix}:track:keep"), b"1", Duration::from_secs(60))
        .await
        .unwrap();

    let removed = store.delete_matching(&format!("{prefix}:airport:*")).await.unwrap();
    assert_eq!(removed, 1_200);
    assert!(store.exists(&format!("{prefix}:track:keep")).await.unwrap());
}

#[tokio::test]
async fn test_compare_and_delete_script() {
    let store = connect().await;
    let key = format!("{}:lock", keys("cad").prefix());

    assert!(store.set_nx_ex(&key, "token-a", Duration::from_secs(10)).await.unwrap());
    assert!(!store.set_nx_ex(&key, "token-b", Duration::from_secs(10)).await.unwrap());
    assert!(!store.compare_and_delete(&key, "token-b").await.unwrap());
    assert!(store.exists(&key).await.unwrap());
    assert!(store.compare_and_delete(&key, "token-a").await.unwrap());
    assert!(!store.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_hash_counters() {
    let store = connect().await;
    let key = format!("{}:stats", keys("hash").prefix());

    assert_eq!(store.hincr(&key, "hits", 1).await.unwrap(), 1);
    assert_eq!(store.hincr(&key, "hits", 4).await.unwrap(), 5);
    store.hset(&key, "last_reset", "0").await.unwrap();

    let fields = store.hgetall(&key).await.unwrap();
    assert_eq!(fields.get("hits").map(String::as_str), Some("5"));
    assert_eq!(fields.get("last_reset").map(String::as_str), Some("0"));
}

#[tokio::test]
async fn test_pipelined_counters() {
    let store = connect().await;
    let prefix = keys("pipeline").prefix().to_string();

    let fixed = format!("{prefix}:fixed");
    assert_eq!(store.incr_with_expiry(&fixed, Duration::from_secs(5)).await.unwrap(), 1);
    assert_eq!(store.incr_with_expiry(&fixed, Duration::from_secs(5)).await.unwrap(), 2);

    let sliding = format!("{prefix}:sliding");
    let window = Duration::from_millis(1_000);
    store.sliding_window(&sliding, 10_000, "a", window).await.unwrap();
    store.sliding_window(&sliding, 10_400, "b", window).await.unwrap();
    let step = store.sliding_window(&sliding, 11_200, "c", window).await.unwrap();
    assert_eq!(step.count, 2);
    assert_eq!(step.oldest_ms, Some(10_400));
}

#[tokio::test]
async fn test_two_level_cache_shares_entries_between_instances() {
    let store = connect().await;
    let keys = keys("shared");

    let writer = TwoLevelCache::new(
        Some(guarded(store.clone())),
        Arc::new(LocalCacheStore::new(&LocalCacheConfig::default())),
        keys.clone(),
    );
    let reader = TwoLevelCache::new(
        Some(guarded(store.clone())),
        Arc::new(LocalCacheStore::new(&LocalCacheConfig::default())),
        keys.clone(),
    );

    let key = CacheKey::new(namespaces::AIRPORT, "EGLL");
    let airport = Airport {
        icao: "EGLL".into(),
        name: "London Heathrow".into(),
    };
    writer.set(&key, &airport, Duration::from_secs(60)).await.unwrap();

    let entry = reader.get::<Airport>(&key).await.expect("shared hit");
    assert_eq!(entry.data, airport);
    assert_eq!(entry.source, CacheSource::Shared);
    assert_eq!(reader.local().len(), 1);

    assert_eq!(writer.clear(Some("airport:*")).await.unwrap(), 1);
    assert!(!store.exists(&keys.key(&key)).await.unwrap());
}

#[tokio::test]
async fn test_distributed_lock_excludes_other_instances() {
    let store = connect().await;
    let keys = keys("locks");
    let options = LockOptions {
        ttl: Duration::from_secs(5),
        retries: 2,
        retry_delay: Duration::from_millis(10),
        ..LockOptions::default()
    };

    let first = ConcurrencyManager::new(
        Some(guarded(store.clone())),
        keys.clone(),
        LockConfig::default(),
        RetryConfig::default(),
    );
    let second = ConcurrencyManager::new(
        Some(guarded(store.clone())),
        keys.clone(),
        LockConfig::default(),
        RetryConfig::default(),
    );

    let held = first.acquire_lock("airport:KJFK", &options).await;
    assert!(held.acquired);
    assert!(!second.acquire_lock("airport:KJFK", &options).await.acquired);
    let forged = skyrelay_cache::LockToken::from_raw("forged");
    assert!(!second.release_lock("airport:KJFK", &forged).await);

    assert!(first.release_lock("airport:KJFK", &held.token).await);
    assert!(second.acquire_lock("airport:KJFK", &options).await.acquired);
}

#[tokio::test]
async fn test_sliding_rate_limit_shared_between_instances() {
    let store = connect().await;
    let keys = keys("rate");
    let config = RateLimitConfig {
        default: RateLimitRule::new(4, 1_000, RateLimitAlgorithm::Sliding),
        classes: Default::default(),
    };

    let a = RateLimiter::new(Some(guarded(store.clone())), keys.clone(), config.clone());
    let b = RateLimiter::new(Some(guarded(store.clone())), keys.clone(), config);

    let mut allowed = 0;
    for i in 0..6 {
        let limiter = if i % 2 == 0 { &a } else { &b };
        if limiter.check("flights:cli").await.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 4);
}
