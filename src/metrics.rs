use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the governance layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Rate limit metrics
    rate_limit_decisions: CounterVec,
    exempt_requests: Counter,
    ledger_fallbacks: Counter,
    probe_duration: Histogram,

    // Cache metrics
    cache_operations: CounterVec,
    invalidated_keys: Counter,
    domain_table_rebuilds: CounterVec,

    // Service metrics
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let rate_limit_decisions = CounterVec::new(
            Opts::new(
                "governance_rate_limit_decisions",
                "Admission decisions by outcome and ledger backend",
            ),
            &["outcome", "backend"],
        )?;

        let exempt_requests = Counter::new(
            "governance_rate_limit_exempt_requests",
            "Requests on exempt paths that skipped rate limiting",
        )?;

        let ledger_fallbacks = Counter::new(
            "governance_ledger_fallbacks",
            "Decisions served by the in-process fallback store",
        )?;

        let probe_duration = Histogram::with_opts(
            HistogramOpts::new(
                "governance_backend_probe_duration_seconds",
                "Duration of backend health probes in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
        )?;

        let cache_operations = CounterVec::new(
            Opts::new(
                "governance_cache_operations",
                "Cache operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let invalidated_keys = Counter::new(
            "governance_cache_invalidated_keys",
            "Keys removed by pattern invalidation",
        )?;

        let domain_table_rebuilds = CounterVec::new(
            Opts::new(
                "governance_domain_table_rebuilds",
                "Domain tables rebuilt from their static source",
            ),
            &["table"],
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "governance_request_duration_seconds",
            "Duration of governed requests in seconds",
        ))?;

        registry.register(Box::new(rate_limit_decisions.clone()))?;
        registry.register(Box::new(exempt_requests.clone()))?;
        registry.register(Box::new(ledger_fallbacks.clone()))?;
        registry.register(Box::new(probe_duration.clone()))?;
        registry.register(Box::new(cache_operations.clone()))?;
        registry.register(Box::new(invalidated_keys.clone()))?;
        registry.register(Box::new(domain_table_rebuilds.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            rate_limit_decisions,
            exempt_requests,
            ledger_fallbacks,
            probe_duration,
            cache_operations,
            invalidated_keys,
            domain_table_rebuilds,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admission decision
    pub fn record_decision(&self, allowed: bool, backend: &str) {
        let outcome = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_decisions
            .with_label_values(&[outcome, backend])
            .inc();
    }

    pub fn record_exempt_request(&self) {
        self.exempt_requests.inc();
    }

    /// Record a decision that had to use the local fallback store
    pub fn record_ledger_fallback(&self) {
        self.ledger_fallbacks.inc();
    }

    pub fn record_probe_duration(&self, duration_seconds: f64) {
        self.probe_duration.observe(duration_seconds);
    }

    /// Record a cache operation (`get`/`set`/`delete`/`exists`) and its result
    pub fn record_cache_operation(&self, operation: &str, result: &str) {
        self.cache_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_invalidated_keys(&self, count: u64) {
        self.invalidated_keys.inc_by(count as f64);
    }

    pub fn record_domain_table_rebuild(&self, table: &str) {
        self.domain_table_rebuilds.with_label_values(&[table]).inc();
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }

    /// Current value of a cache operation counter
    pub fn cache_operation_count(&self, operation: &str, result: &str) -> u64 {
        self.cache_operations
            .with_label_values(&[operation, result])
            .get() as u64
    }

    /// Current value of a decision counter
    pub fn decision_count(&self, allowed: bool, backend: &str) -> u64 {
        let outcome = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_decisions
            .with_label_values(&[outcome, backend])
            .get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
