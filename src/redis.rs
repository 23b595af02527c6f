use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::{future::Future, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    backend::CacheBackend,
    config::BackendConfig,
    error::{GovernanceError, Result},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    pub enable_pipelining: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_millis(500),
            enable_pipelining: true,
        }
    }
}

impl From<&BackendConfig> for RedisConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            url: config.url.clone(),
            connection_timeout: config.connection_timeout(),
            command_timeout: config.command_timeout(),
            enable_pipelining: true,
        }
    }
}

/// Networked [`CacheBackend`] over a Redis connection manager.
///
/// Every command is bounded by `command_timeout`; exceeding it surfaces as
/// [`GovernanceError::BackendUnavailable`] so callers can degrade instead of
/// stalling the request.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisBackend {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GovernanceError::Redis(e)
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout, client.get_connection_manager())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("Failed to create connection manager: {}", e);
                    return Err(GovernanceError::Redis(e));
                }
                Err(_) => {
                    warn!(
                        "Timeout while creating connection manager ({}ms)",
                        config.connection_timeout.as_millis()
                    );
                    return Err(GovernanceError::BackendUnavailable(
                        "timeout while creating Redis connection manager".to_string(),
                    ));
                }
            };

        let backend = Self { connection, config };
        backend.ping().await?;

        info!("Redis backend initialized successfully");
        Ok(backend)
    }

    /// Run a command future under the configured timeout.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(op, error = %e, "Redis command failed");
                Err(GovernanceError::Redis(e))
            }
            Err(_) => Err(GovernanceError::BackendUnavailable(format!(
                "Redis {} timed out after {}ms",
                op,
                self.config.command_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        self.bounded("GET", async move { conn.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded("SETEX", async move {
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl_secs)
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        self.bounded("DEL", async move { conn.del(keys).await }).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        self.bounded("EXISTS", async move { conn.exists(key).await }).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        // SCAN rather than KEYS so a large keyspace does not block the server.
        let mut conn = self.connection.clone();
        self.bounded("SCAN", async move {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok::<_, redis::RedisError>(keys)
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded("ZADD", async move { conn.zadd(key, member, score).await })
            .await
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        self.bounded("ZCARD", async move { conn.zcard(key).await }).await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.connection.clone();
        self.bounded("ZREMRANGEBYSCORE", async move {
            conn.zrembyscore(key, score_bound(min), score_bound(max)).await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded("EXPIRE", async move { conn.expire(key, ttl_secs as i64).await })
            .await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded("PING", async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn ledger_count(&self, key: &str, cutoff: f64) -> Result<u64> {
        let mut conn = self.connection.clone();
        if !self.config.enable_pipelining {
            let _: u64 = self
                .bounded("ZREMRANGEBYSCORE", async {
                    conn.zrembyscore(key, "-inf", score_bound(cutoff)).await
                })
                .await?;
            return self.zcard(key).await;
        }

        let (_, count): (u64, u64) = self
            .bounded("ledger_count", async move {
                redis::pipe()
                    .atomic()
                    .zrembyscore(key, "-inf", score_bound(cutoff))
                    .zcard(key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }

    async fn ledger_record(&self, key: &str, member: &str, score: f64, ttl_secs: u64) -> Result<()> {
        if !self.config.enable_pipelining {
            self.zadd(key, member, score).await?;
            return self.expire(key, ttl_secs).await;
        }

        let mut conn = self.connection.clone();
        self.bounded("ledger_record", async move {
            redis::pipe()
                .atomic()
                .zadd(key, member, score)
                .ignore()
                .expire(key, ttl_secs as i64)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }
}

/// Redis backend that connects on first use.
///
/// Lets the process start while Redis is down: until a connection succeeds,
/// every call fails fast with [`GovernanceError::BackendUnavailable`] and the
/// next call tries again.
pub struct LazyRedisBackend {
    config: RedisConfig,
    inner: OnceCell<RedisBackend>,
}

impl LazyRedisBackend {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            inner: OnceCell::new(),
        }
    }

    /// Wrap an already connected backend.
    pub fn connected(backend: RedisBackend) -> Self {
        let config = backend.config.clone();
        Self {
            config,
            inner: OnceCell::new_with(Some(backend)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.initialized()
    }

    async fn backend(&self) -> Result<&RedisBackend> {
        self.inner
            .get_or_try_init(|| {
                // Reconnect attempts share the command budget so a request
                // never waits on the full startup timeout.
                let config = RedisConfig {
                    connection_timeout: self.config.command_timeout,
                    ..self.config.clone()
                };
                RedisBackend::connect(config)
            })
            .await
    }
}

#[async_trait]
impl CacheBackend for LazyRedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend().await?.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.backend().await?.set_ex(key, value, ttl_secs).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.backend().await?.delete(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.backend().await?.exists(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.backend().await?.keys(pattern).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.backend().await?.zadd(key, member, score).await
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.backend().await?.zcard(key).await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.backend().await?.zrem_range_by_score(key, min, max).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.backend().await?.expire(key, ttl_secs).await
    }

    async fn ping(&self) -> Result<()> {
        self.backend().await?.ping().await
    }

    async fn ledger_count(&self, key: &str, cutoff: f64) -> Result<u64> {
        self.backend().await?.ledger_count(key, cutoff).await
    }

    async fn ledger_record(&self, key: &str, member: &str, score: f64, ttl_secs: u64) -> Result<()> {
        self.backend()
            .await?
            .ledger_record(key, member, score, ttl_secs)
            .await
    }
}

/// Render a score bound the way Redis expects infinities.
fn score_bound(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        format!("{:.3}", score)
    }
}
