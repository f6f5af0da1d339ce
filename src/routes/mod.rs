pub mod health;
pub mod jobs;
pub mod metrics;
pub mod telegram;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Largest accepted request body (photo uploads included).
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Full HTTP surface of the ingestion server.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let metrics_state = metrics::MetricsState {
        handle: prometheus,
        queue: Arc::clone(&state.queue),
    };

    Router::new()
        .route("/", get(|| async { "Ok" }))
        .route("/health", get(health::health_check))
        .route("/telegram/{token}", post(telegram::webhook))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route("/api/v1/results/{job_id}", get(jobs::get_result))
        .route("/results", post(jobs::notify_result))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}
