// Backend diagnostics: checks the configured Redis step by step
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pncp_governance::{
    backend::CacheBackend,
    config::GovernanceConfig,
    redis::{RedisBackend, RedisConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting backend diagnostics...");
    let start_time = Instant::now();

    let config_path = std::env::var("GOVERNANCE_CONFIG").ok();
    let config = GovernanceConfig::load(config_path.as_deref())?;
    info!("Using Redis URL: {}", config.backend.url);
    info!(
        "Rate limit: {} requests / {}s, probe timeout {}ms",
        config.rate_limit.max_requests,
        config.rate_limit.window_seconds,
        config.backend.probe_timeout_ms
    );

    let backend = connect(RedisConfig::from(&config.backend)).await?;
    check_probe_latency(&backend, config.backend.probe_timeout()).await;
    check_ledger_round_trip(&backend).await?;

    info!("✅ All checks completed successfully in {:?}", start_time.elapsed());
    Ok(())
}

async fn connect(config: RedisConfig) -> Result<RedisBackend> {
    info!("🔍 Connecting to Redis...");
    let connection_start = Instant::now();

    match RedisBackend::connect(config).await {
        Ok(backend) => {
            info!("✅ Connected in {:?}", connection_start.elapsed());
            Ok(backend)
        }
        Err(e) => {
            error!("❌ Redis connection failed: {}", e);
            error!("The limiter will run on per-process ledgers until Redis is reachable");
            Err(e.into())
        }
    }
}

async fn check_probe_latency(backend: &RedisBackend, probe_timeout: Duration) {
    info!("Measuring PING latency against the {:?} probe budget...", probe_timeout);
    let mut slow = 0;
    for _ in 0..10 {
        let started = Instant::now();
        let ok = backend.ping().await.is_ok();
        let elapsed = started.elapsed();
        if !ok || elapsed > probe_timeout {
            slow += 1;
        }
    }
    if slow == 0 {
        info!("✅ All probes answered within budget");
    } else {
        warn!("⚠️ {}/10 probes failed or exceeded the budget; requests would use local ledgers", slow);
    }
}

async fn check_ledger_round_trip(backend: &RedisBackend) -> Result<()> {
    info!("Testing ledger commands...");
    let key = format!("rate_limit:diagnostics:{}", uuid::Uuid::new_v4());
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

    backend.ledger_record(&key, &format!("{:.3}:a", now), now, 5).await?;
    backend.ledger_record(&key, &format!("{:.3}:b", now), now, 5).await?;
    let count = backend.ledger_count(&key, now - 5.0).await?;
    backend.delete(&[key.clone()]).await?;

    if count == 2 {
        info!("✅ Ledger round trip counted {} entries", count);
        Ok(())
    } else {
        error!("❌ Expected 2 ledger entries, found {}", count);
        Err(anyhow::anyhow!("ledger round trip mismatch"))
    }
}
