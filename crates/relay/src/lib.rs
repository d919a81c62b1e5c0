// decksync-relay: WebSocket relay that keeps one authoritative document per shard.

pub mod config;
pub mod error;
pub mod metrics;
pub mod room;
pub mod snapshot;
pub mod ws;

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, State},
    http::{header::CONTENT_TYPE, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::{error, info};

use crate::config::RoomConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    RelayError,
};
use crate::metrics::{RelayMetrics, UNMATCHED_ROUTE};
use crate::room::RoomRegistry;
use crate::snapshot::SnapshotStore;

pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomRegistry>,
    pub metrics: Arc<RelayMetrics>,
    pub config: Arc<RoomConfig>,
}

impl AppState {
    pub fn new(config: RoomConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        let rooms = Arc::new(RoomRegistry::new(config.clone(), store, Arc::clone(&metrics)));
        Self { rooms, metrics, config: Arc::new(config) }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    connected_shards: usize,
    connected_clients: usize,
    pending_requests: usize,
}

pub fn build_router(state: AppState) -> Router {
    let metrics = Arc::clone(&state.metrics);
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics))
            .route("/v1/shards/{shard_id}/ws", get(ws::ws_upgrade))
            .with_state(state),
        metrics,
    )
}

pub fn apply_middleware(router: Router, metrics: Arc<RelayMetrics>) -> Router {
    router
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        connected_shards: state.rooms.connected_shards(),
        connected_clients: state.rooms.connected_clients(),
        pending_requests: state.rooms.pending_requests(),
    })
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn not_found() -> RelayError {
    RelayError::not_found()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::internal("request handling panicked").into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<RelayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
        .to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics.record_http_request(method.as_str(), &route, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, AppState, MAX_REQUEST_BODY_BYTES};
    use crate::config::RoomConfig;
    use crate::metrics::RelayMetrics;
    use crate::snapshot::MemorySnapshotStore;

    fn test_state() -> AppState {
        AppState::new(RoomConfig::default(), Arc::new(MemorySnapshotStore::new()))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&body).expect("response body should be valid json")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn health_check_reports_counts_and_request_id() {
        let response = build_router(test_state())
            .oneshot(get_request("/healthz"))
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let parsed = body_json(response).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connected_shards"], 0);
        assert_eq!(parsed["connected_clients"], 0);
        assert_eq!(parsed["pending_requests"], 0);
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed() {
        let response = build_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-from-client")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.headers()["x-request-id"], "req-from-client");
    }

    #[tokio::test]
    async fn metrics_endpoint_counts_previous_requests() {
        let state = test_state();
        let router = build_router(state.clone());
        router.clone().oneshot(get_request("/healthz")).await.expect("healthz should succeed");

        let response =
            router.oneshot(get_request("/metrics")).await.expect("metrics should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body readable");
        let text = String::from_utf8(body.to_vec()).expect("metrics should be utf-8");
        assert!(text.contains("relay_http_requests_total{method=\"GET\",route=\"/healthz\"} 1"));
        assert!(text.contains("relay_active_rooms 0"));
    }

    #[tokio::test]
    async fn invalid_shard_id_is_rejected_before_upgrade() {
        let response = build_router(test_state())
            .oneshot(get_request("/v1/shards/bad%20shard/ws"))
            .await
            .expect("ws request should return a response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(parsed["error"]["details"]["field"], "shard_id");
    }

    #[tokio::test]
    async fn plain_get_on_socket_route_requires_upgrade() {
        let response = build_router(test_state())
            .oneshot(get_request("/v1/shards/page-1/ws"))
            .await
            .expect("ws request should return a response");

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "UPGRADE_REQUIRED");
    }

    #[tokio::test]
    async fn unknown_route_returns_error_envelope() {
        let response = build_router(test_state())
            .oneshot(get_request("/nope"))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "NOT_FOUND");
        assert!(parsed["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(
            Router::new().route("/panic", get(panic_route)),
            Arc::new(RelayMetrics::default()),
        );

        let response = app
            .oneshot(get_request("/panic"))
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(
            Router::new().route("/echo", post(echo)),
            Arc::new(RelayMetrics::default()),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
