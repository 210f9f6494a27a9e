//! Service container built once at startup.
//!
//! `Services::initialize` connects the shared store (degrading to local-only
//! when Redis is disabled or unreachable), wires the resilience components
//! together and starts the local-cache janitor. `shutdown` stops background
//! work and logs the final cache statistics.

use std::sync::Arc;
use std::time::Duration;

use skyrelay_cache::{
    CircuitBreaker, ConcurrencyManager, GuardedStore, LocalCacheStore, RateLimiter, RedisStore,
    StatsSnapshot, TokenCache, TwoLevelCache,
};
use skyrelay_config::{ConfigError, SecretsProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::fetcher::CachedFetcher;
use crate::upstream::{AirportClient, AirportService, FlightClient, FlightService, http_client};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] skyrelay_cache::Error),

    #[error("failed to build upstream client: {0}")]
    Upstream(#[from] skyrelay_cache::UpstreamError),
}

pub struct Services {
    pub cache: TwoLevelCache,
    pub concurrency: ConcurrencyManager,
    pub rate_limiter: Arc<RateLimiter>,
    pub tokens: TokenCache,
    pub fetcher: CachedFetcher,
    pub airports: AirportService,
    pub flights: FlightService,
    stats_namespaces: Vec<String>,
    shutdown: CancellationToken,
    janitor: Option<JoinHandle<()>>,
}

impl Services {
    /// Resolve secrets, connect the shared store and build every component.
    pub async fn initialize(
        config: &AppConfig,
        secrets: SecretsProvider,
    ) -> Result<Self, InitError> {
        let mut config = config.clone();
        config.resolve_secrets(&secrets).await?;

        let keys = config.key_space();
        let shared = connect_shared_store(&config).await?;

        let local = Arc::new(LocalCacheStore::new(&config.cache.local()));
        let shutdown = CancellationToken::new();
        let janitor = local.spawn_janitor(
            Duration::from_secs(config.cache.janitor_interval_secs),
            shutdown.child_token(),
        );

        let cache = TwoLevelCache::new(shared.clone(), local, keys.clone());
        let concurrency = ConcurrencyManager::new(
            shared.clone(),
            keys.clone(),
            config.locks.clone(),
            config.retry.clone(),
        );
        let rate_limiter = Arc::new(RateLimiter::new(
            shared.clone(),
            keys.clone(),
            config.rate_limit.clone(),
        ));
        let tokens = TokenCache::new(
            config.auth.token_cache_config(),
            shared,
            keys.clone(),
            concurrency.clone(),
        )?;
        if !tokens.is_configured() {
            tracing::info!(
                "No upstream credentials configured, flight API calls are unauthenticated"
            );
        }

        let fetcher = CachedFetcher::new(
            cache.clone(),
            concurrency.clone(),
            rate_limiter.clone(),
            tokens.clone(),
            keys.prefix(),
        );

        let http = http_client(config.upstream.timeout())?;
        let airports = AirportService::new(
            AirportClient::new(
                http.clone(),
                &config.upstream.airport_base_url,
                &config.upstream.airport_api_key,
            ),
            fetcher.clone(),
            config.cache.ttl.for_namespace(skyrelay_cache::namespaces::AIRPORT),
        );
        let flights = FlightService::new(
            FlightClient::new(http, &config.upstream.flight_base_url),
            fetcher.clone(),
            config.cache.ttl.clone(),
        );

        tracing::info!(
            mode = cache.mode(),
            key_prefix = keys.prefix(),
            secrets = ?secrets.source_kind(),
            "Services initialized"
        );

        Ok(Self {
            cache,
            concurrency,
            rate_limiter,
            tokens,
            fetcher,
            airports,
            flights,
            stats_namespaces: config.cache.stats_namespaces.clone(),
            shutdown,
            janitor: Some(janitor),
        })
    }

    /// Stats for every configured namespace.
    pub async fn stats(&self) -> Vec<StatsSnapshot> {
        let mut snapshots = Vec::with_capacity(self.stats_namespaces.len());
        for namespace in &self.stats_namespaces {
            snapshots.push(self.cache.stats(namespace).await);
        }
        snapshots
    }

    /// Remove cached payloads matching `pattern`, all of them when `None`.
    pub async fn clear(&self, pattern: Option<&str>) -> skyrelay_cache::Result<u64> {
        let removed = self.cache.clear(pattern).await?;
        tracing::info!(pattern = pattern.unwrap_or("*"), removed, "Cache cleared");
        Ok(removed)
    }

    /// Stop background tasks and log final statistics.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(janitor) = self.janitor.take()
            && let Err(e) = janitor.await
        {
            tracing::warn!(error = %e, "local cache janitor ended abnormally");
        }

        for snapshot in self.stats().await {
            tracing::info!(
                namespace = %snapshot.namespace,
                hits = snapshot.hits,
                misses = snapshot.misses,
                errors = snapshot.errors,
                hit_rate = snapshot.hit_rate(),
                source = %snapshot.source,
                "Final cache stats"
            );
        }
        tracing::info!(in_flight = self.concurrency.in_flight(), "Services shut down");
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("mode", &self.cache.mode())
            .field("tokens", &self.tokens)
            .field("stats_namespaces", &self.stats_namespaces)
            .finish()
    }
}

/// Connect Redis behind the circuit breaker, or return `None` for
/// local-only operation.
async fn connect_shared_store(config: &AppConfig) -> Result<Option<GuardedStore>, InitError> {
    if !config.redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return Ok(None);
    }

    let store_config = config.redis.store_config()?;
    match RedisStore::connect(&store_config).await {
        Ok(store) => {
            let breaker = Arc::new(CircuitBreaker::new("redis", config.circuit_breaker.clone()));
            Ok(Some(GuardedStore::new(Arc::new(store), breaker)))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis, falling back to local cache only"
            );
            Ok(None)
        }
    }
}
