use std::{fmt, sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::SharedBackend,
    config::{RateLimitConfig, RouteLimit, RouteLimits},
    error::{GovernanceError, Result},
    fallback::LocalFallbackStore,
    identity::ClientId,
    metrics::Metrics,
    utils::{calculate_reset, SharedClock},
};

/// Where a decision's ledger lives for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Distributed,
    Local,
}

impl LedgerBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerBackend::Distributed => "distributed",
            LedgerBackend::Local => "local",
        }
    }
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub window_seconds: u64,
    /// Unix seconds at which a full window from now has elapsed
    pub reset_at: i64,
    pub backend: LedgerBackend,
}

/// Ledger key plus the limit it is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    pub key: String,
    pub limit: RouteLimit,
}

/// Sliding-window limiter over exact request timestamps.
///
/// Each call first probes the shared backend with a short PING. A healthy
/// backend serves the ledger as a sorted set; otherwise the call is answered
/// from the in-process [`LocalFallbackStore`]. Concurrent admissions at the
/// limit boundary may over-admit slightly since check and record are
/// separate steps.
pub struct RateLimiter {
    backend: SharedBackend,
    fallback: LocalFallbackStore,
    clock: SharedClock,
    default_limit: RouteLimit,
    routes: RouteLimits,
    key_prefix: String,
    probe_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        config: &RateLimitConfig,
        backend: SharedBackend,
        fallback: LocalFallbackStore,
        clock: SharedClock,
        probe_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            fallback,
            clock,
            default_limit: config.default_limit(),
            routes: config.compile_routes()?,
            key_prefix: config.key_prefix.clone(),
            probe_timeout,
            metrics,
        })
    }

    pub fn default_limit(&self) -> RouteLimit {
        self.default_limit
    }

    pub fn fallback(&self) -> &LocalFallbackStore {
        &self.fallback
    }

    /// Ledger a request path is counted in. Paths under a configured route
    /// get their own ledger and limit; everything else shares the global one.
    pub fn ledger_for(&self, id: &ClientId, path: Option<&str>) -> Ledger {
        match path.and_then(|p| self.routes.resolve(p)) {
            Some((route, limit)) => Ledger {
                key: format!("{}:{}:{}", self.key_prefix, route, id),
                limit,
            },
            None => Ledger {
                key: format!("{}:{}", self.key_prefix, id),
                limit: self.default_limit,
            },
        }
    }

    /// Whether another request fits in the client's global window.
    pub async fn is_allowed(&self, id: &ClientId) -> bool {
        let ledger = self.ledger_for(id, None);
        let backend = self.select_backend().await;
        let (count, _) = self.count_on(backend, &ledger).await;
        count < ledger.limit.max_requests as u64
    }

    /// Record an admitted request in the client's global window.
    pub async fn record(&self, id: &ClientId) {
        let ledger = self.ledger_for(id, None);
        let backend = self.select_backend().await;
        self.record_on(backend, &ledger).await;
    }

    /// Requests left in the client's global window.
    pub async fn remaining(&self, id: &ClientId) -> u32 {
        let ledger = self.ledger_for(id, None);
        let backend = self.select_backend().await;
        let (count, _) = self.count_on(backend, &ledger).await;
        remaining_of(ledger.limit, count)
    }

    /// Check, record (when allowed) and count in one pass, against a single
    /// backend choice.
    pub async fn admit(&self, id: &ClientId, path: Option<&str>) -> Decision {
        let ledger = self.ledger_for(id, path);
        let backend = self.select_backend().await;

        let (count, backend) = self.count_on(backend, &ledger).await;
        let allowed = count < ledger.limit.max_requests as u64;

        let (remaining, backend) = if allowed {
            let backend = self.record_on(backend, &ledger).await;
            let (count, backend) = self.count_on(backend, &ledger).await;
            (remaining_of(ledger.limit, count), backend)
        } else {
            (0, backend)
        };

        self.metrics.record_decision(allowed, backend.as_str());
        if backend == LedgerBackend::Local {
            self.metrics.record_ledger_fallback();
        }
        if !allowed {
            debug!(client = %id, key = %ledger.key, limit = %ledger.limit, "Rate limit exceeded");
        }

        Decision {
            allowed,
            limit: ledger.limit.max_requests,
            remaining,
            window_seconds: ledger.limit.window_seconds,
            reset_at: calculate_reset(ledger.limit.window_seconds, self.clock.as_ref()),
            backend,
        }
    }

    /// Probe the shared backend within the probe timeout.
    pub async fn select_backend(&self) -> LedgerBackend {
        let started = Instant::now();
        let probe = match timeout(self.probe_timeout, self.backend.ping()).await {
            Ok(result) => result,
            Err(_) => Err(GovernanceError::BackendUnavailable(format!(
                "health probe timed out after {:?}",
                self.probe_timeout
            ))),
        };
        self.metrics
            .record_probe_duration(started.elapsed().as_secs_f64());

        match probe {
            Ok(()) => LedgerBackend::Distributed,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Backend probe failed, using local ledgers");
                LedgerBackend::Local
            }
        }
    }

    async fn count_on(&self, backend: LedgerBackend, ledger: &Ledger) -> (u64, LedgerBackend) {
        let now = self.clock.now();
        if backend == LedgerBackend::Distributed {
            let cutoff = now - ledger.limit.window_seconds as f64;
            match self.backend.ledger_count(&ledger.key, cutoff).await {
                Ok(count) => return (count, LedgerBackend::Distributed),
                Err(e) => {
                    warn!(key = %ledger.key, error = %e, "Ledger count failed, using local ledger");
                }
            }
        }
        (self.fallback.count(&ledger.key, now).await, LedgerBackend::Local)
    }

    async fn record_on(&self, backend: LedgerBackend, ledger: &Ledger) -> LedgerBackend {
        let now = self.clock.now();
        let window = ledger.limit.window_seconds;
        if backend == LedgerBackend::Distributed {
            // Unique member so requests in the same instant are not merged.
            let member = format!("{:.3}:{}", now, Uuid::new_v4());
            match self
                .backend
                .ledger_record(&ledger.key, &member, now, window)
                .await
            {
                Ok(()) => return LedgerBackend::Distributed,
                Err(e) => {
                    warn!(key = %ledger.key, error = %e, "Ledger record failed, using local ledger");
                }
            }
        }
        self.fallback
            .record(&ledger.key, now, Duration::from_secs(window))
            .await;
        LedgerBackend::Local
    }
}

fn remaining_of(limit: RouteLimit, count: u64) -> u32 {
    (limit.max_requests as u64).saturating_sub(count) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{CacheBackend, InMemoryBackend},
        config::RouteLimitSpec,
        utils::ManualClock,
    };

    struct Harness {
        limiter: RateLimiter,
        backend: Arc<InMemoryBackend>,
        clock: ManualClock,
        metrics: Arc<Metrics>,
    }

    const T0: f64 = 1_700_000_000.0;

    fn harness(config: RateLimitConfig) -> Harness {
        let clock = ManualClock::new(T0);
        let backend = Arc::new(InMemoryBackend::with_clock(Arc::new(clock.clone())));
        let metrics = Arc::new(Metrics::default());
        let limiter = RateLimiter::new(
            &config,
            backend.clone(),
            LocalFallbackStore::default(),
            Arc::new(clock.clone()),
            Duration::from_millis(50),
            metrics.clone(),
        )
        .unwrap();
        Harness {
            limiter,
            backend,
            clock,
            metrics,
        }
    }

    fn three_per_minute() -> RateLimitConfig {
        RateLimitConfig {
            max_requests: 3,
            window_seconds: 60,
            ..Default::default()
        }
    }

    fn client() -> ClientId {
        ClientId::ip("10.0.0.1".parse().unwrap())
    }

    impl Harness {
        fn at(&self, offset: f64) {
            self.clock.set(T0 + offset);
        }
    }

    #[tokio::test]
    async fn test_sliding_window_scenario() {
        let h = harness(three_per_minute());
        let id = client();

        for (t, remaining) in [(0.0, 2), (1.0, 1), (2.0, 0)] {
            h.at(t);
            let decision = h.limiter.admit(&id, None).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
            assert_eq!(decision.backend, LedgerBackend::Distributed);
        }

        h.at(3.0);
        let rejected = h.limiter.admit(&id, None).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.window_seconds, 60);

        // The window is (1, 61]: t=2 is still counted alongside t=61.
        h.at(61.0);
        let decision = h.limiter.admit(&id, None).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        h.at(62.5);
        assert_eq!(h.limiter.remaining(&id).await, 2);
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_recorded() {
        let h = harness(three_per_minute());
        let id = client();
        for _ in 0..10 {
            h.limiter.admit(&id, None).await;
        }
        assert_eq!(h.backend.zcard("rate_limit:ip:10.0.0.1").await.unwrap(), 3);
        assert_eq!(h.metrics.decision_count(false, "distributed"), 7);
    }

    #[tokio::test]
    async fn test_entry_leaves_exactly_at_window_edge() {
        let h = harness(three_per_minute());
        let id = client();
        for t in [0.0, 0.0, 0.0] {
            h.at(t);
            h.limiter.record(&id).await;
        }
        h.at(59.999);
        assert!(!h.limiter.is_allowed(&id).await);
        h.at(60.0);
        assert!(h.limiter.is_allowed(&id).await);
        assert_eq!(h.limiter.remaining(&id).await, 3);
    }

    #[tokio::test]
    async fn test_same_instant_requests_are_counted_separately() {
        let h = harness(three_per_minute());
        let id = client();
        h.limiter.record(&id).await;
        h.limiter.record(&id).await;
        assert_eq!(h.limiter.remaining(&id).await, 1);
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let h = harness(three_per_minute());
        let a = client();
        let b = ClientId::user("42");
        for _ in 0..3 {
            h.limiter.admit(&a, None).await;
        }
        assert!(!h.limiter.is_allowed(&a).await);
        assert!(h.limiter.is_allowed(&b).await);
        assert_eq!(h.limiter.remaining(&b).await, 3);
    }

    #[tokio::test]
    async fn test_ledger_expires_with_window() {
        let h = harness(three_per_minute());
        let id = client();
        h.limiter.record(&id).await;
        assert!(h.backend.exists("rate_limit:ip:10.0.0.1").await.unwrap());
        h.at(60.0);
        assert!(!h.backend.exists("rate_limit:ip:10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_backend_uses_local_ledger() {
        let h = harness(three_per_minute());
        h.backend.set_available(false);
        let id = client();

        for remaining in [2, 1, 0] {
            let decision = h.limiter.admit(&id, None).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
            assert_eq!(decision.backend, LedgerBackend::Local);
        }
        assert!(!h.limiter.admit(&id, None).await.allowed);
        assert_eq!(h.metrics.decision_count(false, "local"), 1);
    }

    #[tokio::test]
    async fn test_slow_probe_falls_back() {
        let h = harness(three_per_minute());
        h.backend.set_latency(Some(Duration::from_millis(200)));
        assert_eq!(h.limiter.select_backend().await, LedgerBackend::Local);
        h.backend.set_latency(None);
        assert_eq!(h.limiter.select_backend().await, LedgerBackend::Distributed);
    }

    #[tokio::test]
    async fn test_backend_recovery_is_picked_up_per_call() {
        let h = harness(three_per_minute());
        let id = client();
        h.backend.set_available(false);
        assert_eq!(h.limiter.admit(&id, None).await.backend, LedgerBackend::Local);

        h.backend.set_available(true);
        let decision = h.limiter.admit(&id, None).await;
        assert_eq!(decision.backend, LedgerBackend::Distributed);
        // Local entries are not migrated to the shared ledger.
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_route_override_uses_own_ledger() {
        let mut config = three_per_minute();
        config.route_limits.insert(
            "/api/v1/contratacoes/sync".to_string(),
            RouteLimitSpec::Expression("1/minute".to_string()),
        );
        let h = harness(config);
        let id = client();

        let first = h.limiter.admit(&id, Some("/api/v1/contratacoes/sync")).await;
        assert!(first.allowed);
        assert_eq!(first.limit, 1);
        assert!(!h.limiter.admit(&id, Some("/api/v1/contratacoes/sync")).await.allowed);

        // The global ledger is untouched.
        let other = h.limiter.admit(&id, Some("/api/v1/pca")).await;
        assert!(other.allowed);
        assert_eq!(other.remaining, 2);
        assert!(h
            .backend
            .exists("rate_limit:/api/v1/contratacoes/sync:ip:10.0.0.1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reset_at_is_one_window_ahead() {
        let h = harness(three_per_minute());
        h.at(0.4);
        let decision = h.limiter.admit(&client(), None).await;
        assert_eq!(decision.reset_at, T0 as i64 + 60);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let clock = ManualClock::new(T0);
        let config = RateLimitConfig {
            max_requests: 0,
            ..Default::default()
        };
        let result = RateLimiter::new(
            &config,
            Arc::new(InMemoryBackend::new()),
            LocalFallbackStore::default(),
            Arc::new(clock),
            Duration::from_millis(50),
            Arc::new(Metrics::default()),
        );
        assert!(result.is_err());
    }
}
