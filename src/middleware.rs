//! Request governance as an axum middleware.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/api/v1/pca", get(list_pca))
//!     .layer(axum::middleware::from_fn_with_state(service.clone(), governance_middleware));
//! ```

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::warn;

use crate::{identity::ClientId, limiter::Decision, service::GovernanceService};

fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_at: i64) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(reset_at),
    );
}

/// 429 answer for a client that has used up its window.
#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    pub client: ClientId,
    pub limit: u32,
    pub retry_after: u64,
    pub reset_at: i64,
}

impl RateLimitRejection {
    fn from_decision(client: ClientId, decision: &Decision) -> Self {
        Self {
            client,
            limit: decision.limit,
            retry_after: decision.window_seconds,
            reset_at: decision.reset_at,
        }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let body = json!({
            "error": "rate_limit_exceeded",
            "detail": "Rate limit exceeded. Please try again later.",
            "retry_after": self.retry_after,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(self.retry_after));
        insert_rate_limit_headers(headers, self.limit, 0, self.reset_at);
        response
    }
}

/// Exempt paths pass straight through. Everything else is identified,
/// admitted or rejected, and gets the `X-RateLimit-*` headers on the way out.
pub async fn governance_middleware(
    State(service): State<Arc<GovernanceService>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if service.is_exempt(&path) {
        service.metrics().record_exempt_request();
        return next.run(req).await;
    }

    let _timer = service.metrics().start_request_timer();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = service.identifier().identify(req.headers(), remote);

    let decision = service.admit(&client, &path).await;
    if !decision.allowed {
        warn!(client = %client, path = %path, "Rate limit exceeded");
        return RateLimitRejection::from_decision(client, &decision).into_response();
    }

    let mut response = next.run(req).await;
    insert_rate_limit_headers(
        response.headers_mut(),
        decision.limit,
        decision.remaining,
        decision.reset_at,
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::InMemoryBackend,
        config::{GovernanceConfig, RateLimitConfig},
        utils::ManualClock,
    };
    use axum::{body::Body, routing::get, Router};
    use tower::ServiceExt;

    async fn app(max_requests: u32) -> Router {
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let config = GovernanceConfig {
            rate_limit: RateLimitConfig {
                max_requests,
                ..Default::default()
            },
            ..Default::default()
        };
        let service = Arc::new(
            GovernanceService::builder(config)
                .backend(Arc::new(InMemoryBackend::with_clock(clock.clone())))
                .clock(clock)
                .build()
                .await
                .unwrap(),
        );
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/v1/pca", get(|| async { "[]" }))
            .layer(axum::middleware::from_fn_with_state(service, governance_middleware))
    }

    fn request(path: &str) -> Request {
        let mut req = http::Request::builder().uri(path).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 40000))));
        req
    }

    #[tokio::test]
    async fn test_admitted_requests_carry_headers() {
        let app = app(2).await;
        let response = app.oneshot(request("/api/v1/pca")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
        assert_eq!(response.headers()["x-ratelimit-reset"], "1700000060");
    }

    #[tokio::test]
    async fn test_rejection_is_429_with_retry_after() {
        let app = app(1).await;
        let first = app.clone().oneshot(request("/api/v1/pca")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let rejected = app.oneshot(request("/api/v1/pca")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()["retry-after"], "60");

        let body = axum::body::to_bytes(rejected.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["retry_after"], 60);
    }

    #[tokio::test]
    async fn test_exempt_paths_skip_governance() {
        let app = app(1).await;
        for _ in 0..5 {
            let response = app.clone().oneshot(request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
        let response = app.oneshot(request("/api/v1/pca")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
