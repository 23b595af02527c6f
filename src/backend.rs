//! Key-value backend abstraction.
//!
//! [`CacheBackend`] is the slice of a Redis-like store the governance layer
//! needs: plain string values with expiry, key scans by glob pattern, and the
//! sorted-set primitives used as sliding-window ledgers. The production
//! implementation is [`crate::redis::RedisBackend`]; [`InMemoryBackend`] serves
//! single-process deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    error::{GovernanceError, Result},
    utils::{SharedClock, SystemClock},
};

/// Operations the governance layer issues against the networked store.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `SETEX key ttl value`
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// `DEL key…`, returning how many keys existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys matching a glob pattern (`KEYS`/`SCAN MATCH`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// `ZADD key score member`
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// `ZCARD key`
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// `ZREMRANGEBYSCORE key min max` (both bounds inclusive)
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// `EXPIRE key ttl`
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    /// `PING`
    async fn ping(&self) -> Result<()>;

    /// Drop ledger entries scored at or below `cutoff`, then count the rest.
    async fn ledger_count(&self, key: &str, cutoff: f64) -> Result<u64> {
        self.zrem_range_by_score(key, f64::NEG_INFINITY, cutoff).await?;
        self.zcard(key).await
    }

    /// Add a ledger entry and push the ledger expiry out to `ttl_secs`.
    async fn ledger_record(&self, key: &str, member: &str, score: f64, ttl_secs: u64) -> Result<()> {
        self.zadd(key, member, score).await?;
        self.expire(key, ttl_secs).await
    }
}

/// Shared backend handle.
pub type SharedBackend = Arc<dyn CacheBackend>;

/// Redis-style glob pattern (`*`, `?`, `[abc]`, `[^a-z]`, `\` escapes).
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut out = String::with_capacity(pattern.len() * 2 + 2);
        out.push('^');
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => out.push_str(".*"),
                '?' => out.push('.'),
                '\\' => match chars.next() {
                    Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                    None => out.push_str(r"\\"),
                },
                '[' => {
                    let mut class = String::from("[");
                    if chars.peek() == Some(&'^') {
                        chars.next();
                        class.push('^');
                    }
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == ']' {
                            closed = true;
                            break;
                        }
                        match inner {
                            '\\' | '[' | '&' | '~' => {
                                class.push('\\');
                                class.push(inner);
                            }
                            _ => class.push(inner),
                        }
                    }
                    if !closed {
                        return Err(GovernanceError::Config(format!(
                            "unterminated character class in pattern '{}'",
                            pattern
                        )));
                    }
                    class.push(']');
                    out.push_str(&class);
                }
                other => out.push_str(&regex::escape(&other.to_string())),
            }
        }
        out.push('$');

        let regex = Regex::new(&out).map_err(|e| {
            GovernanceError::Config(format!("invalid pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { regex })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<f64>,
}

impl StoredEntry {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process implementation of [`CacheBackend`].
///
/// Expiry is evaluated lazily against the configured clock, so tests can move
/// time forward without sleeping. The store can be switched "offline" to
/// exercise the degraded paths of the limiter and the cache.
pub struct InMemoryBackend {
    entries: DashMap<String, StoredEntry>,
    clock: SharedClock,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation, to exercise call timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn gate(&self) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GovernanceError::BackendUnavailable(
                "in-memory backend is offline".to_string(),
            ))
        }
    }

    /// Drop the key if it has expired; returns whether a live entry remains.
    fn purge_if_expired(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries.contains_key(key)
    }

    fn wrong_type(key: &str) -> GovernanceError {
        GovernanceError::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE Operation against a key holding the wrong kind of value",
            key.to_string(),
        )))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(None);
        }
        match self.entries.get(key).map(|e| e.value.clone()) {
            Some(StoredValue::Text(value)) => Ok(Some(value)),
            Some(StoredValue::Sorted(_)) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.gate().await?;
        let expires_at = self.clock.now() + ttl_secs as f64;
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.gate().await?;
        let now = self.clock.now();
        let deleted = keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, entry)| !entry.is_expired(now))
            .count();
        Ok(deleted as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.gate().await?;
        Ok(self.purge_if_expired(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.gate().await?;
        let glob = GlobPattern::new(pattern)?;
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && glob.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.gate().await?;
        self.purge_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| StoredEntry {
            value: StoredValue::Sorted(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Sorted(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            StoredValue::Text(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(0);
        }
        match self.entries.get(key).as_deref().map(|e| &e.value) {
            Some(StoredValue::Sorted(members)) => Ok(members.len() as u64),
            Some(StoredValue::Text(_)) => Err(Self::wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(0);
        }
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                StoredValue::Sorted(members) => {
                    let before = members.len();
                    members.retain(|_, score| *score < min || *score > max);
                    (before - members.len()) as u64
                }
                StoredValue::Text(_) => return Err(Self::wrong_type(key)),
            },
            None => 0,
        };
        // Redis deletes a sorted set once its last member is gone.
        self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, StoredValue::Sorted(members) if members.is_empty())
        });
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.gate().await?;
        let expires_at = self.clock.now() + ttl_secs as f64;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.gate().await
    }
}
