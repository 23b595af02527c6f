use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc};
use tracing::{info, warn};

use crate::{
    backend::{InMemoryBackend, SharedBackend},
    cache::CacheService,
    config::{BackendKind, GovernanceConfig},
    domain::{DomainCacheService, DomainTable},
    error::Result,
    fallback::LocalFallbackStore,
    identity::{ClientId, ClientIdentifier, CredentialVerifier, JwtVerifier},
    invalidation::{Entity, PatternInvalidator},
    limiter::{Decision, RateLimiter},
    metrics::Metrics,
    redis::{LazyRedisBackend, RedisBackend, RedisConfig},
    utils::{SharedClock, SystemClock},
};

/// Backend status reported by [`GovernanceService::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub backend: &'static str,
    pub backend_available: bool,
    pub local_ledgers: u64,
}

/// Entry point for the request pipeline and for business code.
pub struct GovernanceService {
    config: GovernanceConfig,
    backend: SharedBackend,
    limiter: RateLimiter,
    identifier: ClientIdentifier,
    cache: Arc<CacheService>,
    domain: DomainCacheService,
    invalidator: PatternInvalidator,
    metrics: Arc<Metrics>,
}

impl GovernanceService {
    pub fn builder(config: GovernanceConfig) -> GovernanceServiceBuilder {
        GovernanceServiceBuilder {
            config,
            backend: None,
            clock: None,
            verifier: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn identifier(&self) -> &ClientIdentifier {
        &self.identifier
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn domain_cache(&self) -> &DomainCacheService {
        &self.domain
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config.rate_limit.is_exempt(path)
    }

    // Pipeline API

    pub async fn is_request_allowed(&self, id: &ClientId) -> bool {
        self.limiter.is_allowed(id).await
    }

    pub async fn record_request(&self, id: &ClientId) {
        self.limiter.record(id).await
    }

    pub async fn remaining_requests(&self, id: &ClientId) -> u32 {
        self.limiter.remaining(id).await
    }

    pub async fn admit(&self, id: &ClientId, path: &str) -> Decision {
        self.limiter.admit(id, Some(path)).await
    }

    // Business API

    pub async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cache.get(key).await
    }

    pub async fn cache_set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> bool {
        self.cache.set(key, value, ttl_secs).await
    }

    pub async fn cache_delete(&self, key: &str) -> bool {
        self.cache.delete(key).await
    }

    pub async fn cache_exists(&self, key: &str) -> bool {
        self.cache.exists(key).await
    }

    pub async fn cache_get_or_set<T, F, Fut>(&self, key: &str, producer: F, ttl_secs: Option<u64>) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.cache.get_or_set(key, producer, ttl_secs).await
    }

    pub async fn clear_cache_pattern(&self, pattern: &str) -> u64 {
        self.invalidator.clear_pattern(pattern).await
    }

    pub async fn invalidate_entity(&self, entity: Entity, id: Option<&str>) -> u64 {
        self.invalidator.invalidate_entity(entity, id).await
    }

    pub async fn domain_table(&self, name: &str) -> Result<DomainTable> {
        self.domain.get_table(name).await
    }

    pub async fn warm_domain_cache(&self) -> usize {
        self.domain.warm_all().await
    }

    pub async fn health_check(&self) -> HealthStatus {
        let backend_available = match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Backend health check failed");
                false
            }
        };
        HealthStatus {
            backend: self.backend.name(),
            backend_available,
            local_ledgers: self.limiter.fallback().tracked_ledgers(),
        }
    }
}

pub struct GovernanceServiceBuilder {
    config: GovernanceConfig,
    backend: Option<SharedBackend>,
    clock: Option<SharedClock>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    metrics: Option<Arc<Metrics>>,
}

impl GovernanceServiceBuilder {
    /// Use this backend instead of the one named in the configuration.
    pub fn backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> Result<GovernanceService> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = self.metrics.unwrap_or_default();
        let backend = match self.backend {
            Some(backend) => backend,
            None => connect_backend(&config, clock.clone()).await,
        };
        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(JwtVerifier::from_config(&config.auth)?),
        };

        let limiter = RateLimiter::new(
            &config.rate_limit,
            backend.clone(),
            LocalFallbackStore::default(),
            clock,
            config.backend.probe_timeout(),
            metrics.clone(),
        )?;
        let cache = Arc::new(CacheService::new(backend.clone(), &config.cache, metrics.clone()));
        let domain = DomainCacheService::new(cache.clone(), config.cache.domain_ttl_secs, metrics.clone());
        let invalidator =
            PatternInvalidator::new(backend.clone(), &config.rate_limit.key_prefix, metrics.clone());

        info!(
            backend = backend.name(),
            max_requests = config.rate_limit.max_requests,
            window_seconds = config.rate_limit.window_seconds,
            "Governance service ready"
        );

        Ok(GovernanceService {
            config,
            backend,
            limiter,
            identifier: ClientIdentifier::new(verifier),
            cache,
            domain,
            invalidator,
            metrics,
        })
    }
}

/// Backend named by the configuration. An unreachable Redis does not stop
/// startup; it is retried on use while the limiter runs on local ledgers.
async fn connect_backend(config: &GovernanceConfig, clock: SharedClock) -> SharedBackend {
    match config.backend.kind {
        BackendKind::Memory => Arc::new(InMemoryBackend::with_clock(clock)),
        BackendKind::Redis => {
            let redis_config = RedisConfig::from(&config.backend);
            match RedisBackend::connect(redis_config.clone()).await {
                Ok(backend) => Arc::new(LazyRedisBackend::connected(backend)),
                Err(e) => {
                    warn!(url = %config.backend.url, error = %e, "Redis unavailable at startup, will retry on use");
                    Arc::new(LazyRedisBackend::new(redis_config))
                }
            }
        }
    }
}
