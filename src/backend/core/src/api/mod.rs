//! HTTP API for dsq.
//!
//! # Routes
//!
//! - `POST /jobs` - submit a job
//! - `POST /jobs/pull` - claim the next job for a worker size class
//! - `POST /jobs/report` - report the outcome of a claimed job
//! - `GET /cache` - read a result, scheduling it when missing or stale
//! - `POST /entities/:entity/invalidate` - invalidation webhook
//! - `POST /admin/backfill` - run a backfill
//! - `GET /queue/depth` - waiting counts per job type and size class
//! - `GET /health`, `GET /metrics`
//!
//! Errors are returned as [`crate::error::ErrorResponse`] bodies with the
//! status of their [`crate::error::ErrorCode`].

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::service::JobService;
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: JobService,
    pub metrics: MetricsRegistry,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/pull", post(handlers::pull_job))
        .route("/jobs/report", post(handlers::report_job))
        .route("/cache", get(handlers::get_cached))
        .route("/entities/:entity/invalidate", post(handlers::invalidate_entity))
        .route("/admin/backfill", post(handlers::run_backfill))
        .route("/queue/depth", get(handlers::queue_depth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
    }
}
