use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt::Display, future::Future, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    backend::SharedBackend,
    config::CacheConfig,
    metrics::Metrics,
    value::CacheValue,
};

/// Typed, fail-soft cache over a [`crate::backend::CacheBackend`].
///
/// Values are stored as JSON text. Nothing here returns an error: a backend
/// fault or a payload that no longer decodes is a miss on read and "not
/// cached" on write, logged at warn.
///
/// [`CacheService::get_or_set`] is not atomic. Concurrent misses on the same
/// key each run their producer (cache stampede) unless single-flight is
/// enabled, and even then only callers in the same process are coalesced.
pub struct CacheService {
    backend: SharedBackend,
    default_ttl_secs: u64,
    single_flight: bool,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    metrics: Arc<Metrics>,
}

impl CacheService {
    pub fn new(backend: SharedBackend, config: &CacheConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            default_ttl_secs: config.default_ttl_secs,
            single_flight: config.single_flight,
            inflight: DashMap::new(),
            metrics,
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Fetch and decode a value; `None` on miss, decode failure or backend fault.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.metrics.record_cache_operation("get", "miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "Cache GET failed, treating as miss");
                self.metrics.record_cache_operation("get", "error");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.metrics.record_cache_operation("get", "hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "Cached payload failed to decode, treating as miss");
                self.metrics.record_cache_operation("get", "decode_error");
                None
            }
        }
    }

    /// Heterogeneous payload read.
    pub async fn get_value(&self, key: &str) -> Option<CacheValue> {
        self.get::<CacheValue>(key).await
    }

    /// Encode and store a value. `ttl_secs = None` uses the default TTL.
    /// Returns whether the value is now cached.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> bool {
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        if ttl == 0 {
            debug!(key, "Zero TTL, not caching");
            self.metrics.record_cache_operation("set", "skipped");
            return false;
        }

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Value failed to encode, not caching");
                self.metrics.record_cache_operation("set", "encode_error");
                return false;
            }
        };

        match self.backend.set_ex(key, &payload, ttl).await {
            Ok(()) => {
                self.metrics.record_cache_operation("set", "ok");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Cache SET failed, value not cached");
                self.metrics.record_cache_operation("set", "error");
                false
            }
        }
    }

    /// Remove a key; `true` when a live key was deleted.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(&[key.to_string()]).await {
            Ok(deleted) => deleted > 0,
            Err(e) => {
                warn!(key, error = %e, "Cache DELETE failed");
                self.metrics.record_cache_operation("delete", "error");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.backend.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key, error = %e, "Cache EXISTS failed");
                self.metrics.record_cache_operation("exists", "error");
                false
            }
        }
    }

    /// Return the cached value, or run `producer`, cache its result and
    /// return it.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, producer: F, ttl_secs: Option<u64>) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.single_flight {
            return self.get_or_set_coalesced(key, producer, ttl_secs).await;
        }

        if let Some(cached) = self.get(key).await {
            return cached;
        }
        let value = producer().await;
        self.set(key, &value, ttl_secs).await;
        value
    }

    /// Like [`CacheService::get_or_set`] for producers that can fail. Errors
    /// are returned to the caller and nothing is cached.
    pub async fn try_get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl_secs: Option<u64>,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }
        let value = producer().await?;
        self.set(key, &value, ttl_secs).await;
        Ok(value)
    }

    /// Single-flight variant: concurrent misses for `key` inside this process
    /// wait for the first producer instead of running their own.
    pub async fn get_or_set_coalesced<T, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl_secs: Option<u64>,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(cached) = self.get(key).await {
            return cached;
        }

        let gate = self.inflight.entry(key.to_string()).or_default().clone();
        let value = {
            let _turn = gate.lock().await;
            match self.get(key).await {
                Some(cached) => cached,
                None => {
                    let value = producer().await;
                    self.set(key, &value, ttl_secs).await;
                    value
                }
            }
        };

        // Only this caller and the map still hold the gate: nobody is waiting.
        self.inflight
            .remove_if(key, |_, held| Arc::strong_count(held) <= 2);
        value
    }
}

/// Builder for `<prefix>_<name>:<value>_<name>:<value>` cache keys.
///
/// Parameters are sorted by name and `None` values are skipped, so the same
/// filter set always yields the same key regardless of argument order. The
/// prefix is followed by `_` so pattern invalidation (`pca_list_*`) finds
/// the whole family.
#[derive(Debug, Clone)]
pub struct CacheKey {
    prefix: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn param_opt<V: Display>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    /// Add every non-null top-level field of a serializable filter struct.
    /// Filters that do not serialize to an object add nothing.
    pub fn filters<T: Serialize>(mut self, filters: &T) -> Self {
        let fields = match serde_json::to_value(filters) {
            Ok(serde_json::Value::Object(fields)) => fields,
            Ok(other) => {
                warn!(prefix = %self.prefix, kind = json_kind(&other), "Key filters are not an object, ignored");
                return self;
            }
            Err(e) => {
                warn!(prefix = %self.prefix, error = %e, "Key filters failed to serialize, ignored");
                return self;
            }
        };
        for (name, value) in fields {
            match value {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => {
                    self.params.insert(name, s);
                }
                other => {
                    self.params.insert(name, other.to_string());
                }
            }
        }
        self
    }

    pub fn build(&self) -> String {
        if self.params.is_empty() {
            return self.prefix.clone();
        }
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("_");
        format!("{}_{}", self.prefix, params)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
