use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json,
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pncp_governance::{
    domain::DomainTable, error::GovernanceError, governance_middleware, GovernanceConfig, GovernanceService,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pncp_governance=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting PNCP governance service");

    let config_path = std::env::var("GOVERNANCE_CONFIG").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let config = GovernanceConfig::load(config_path.as_deref())?;
    let http_addr = config.server.http_addr;

    let service = Arc::new(GovernanceService::builder(config).build().await?);
    service.warm_domain_cache().await;

    let app = router(service);
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

fn router(service: Arc<GovernanceService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/domain-cache/warm", post(warm_domain_cache))
        .route("/domain/:table", get(domain_table))
        .layer(from_fn_with_state(service.clone(), governance_middleware))
        .with_state(service)
}

async fn health_check(State(service): State<Arc<GovernanceService>>) -> Json<serde_json::Value> {
    let health = service.health_check().await;
    let status = if health.backend_available { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "backend": health,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler(State(service): State<Arc<GovernanceService>>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = service.metrics().registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClearCacheRequest {
    pattern: Option<String>,
}

async fn clear_cache(
    State(service): State<Arc<GovernanceService>>,
    body: Option<Json<ClearCacheRequest>>,
) -> Json<serde_json::Value> {
    let pattern = body
        .and_then(|Json(req)| req.pattern)
        .unwrap_or_else(|| "*".to_string());
    let deleted = service.clear_cache_pattern(&pattern).await;
    info!(pattern = %pattern, deleted, "Cache cleared by admin request");
    Json(json!({ "pattern": pattern, "deleted": deleted }))
}

async fn warm_domain_cache(State(service): State<Arc<GovernanceService>>) -> Json<serde_json::Value> {
    let tables = service.warm_domain_cache().await;
    Json(json!({ "tables": tables }))
}

async fn domain_table(
    State(service): State<Arc<GovernanceService>>,
    Path(table): Path<String>,
) -> Result<Json<DomainTable>, (StatusCode, Json<serde_json::Value>)> {
    match service.domain_table(&table).await {
        Ok(table) => Ok(Json(table)),
        Err(e @ GovernanceError::UnknownDomainTable(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown_domain_table", "detail": e.to_string() })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal_error", "detail": e.to_string() })),
        )),
    }
}
