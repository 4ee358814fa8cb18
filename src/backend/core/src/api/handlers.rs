//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, DsqError>` so that errors
//! are converted to HTTP status codes via the `IntoResponse` implementation
//! on `DsqError`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::backfill::BackfillScope;
use crate::cache::{CacheEntry, GetOrSchedule};
use crate::error::{DsqError, Result};
use crate::jobs::{
    ClaimToken, JobKey, JobOutcome, JobPriority, JobType, QueueEntry, ReportDisposition,
    WorkerSizeClass,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.service.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if health.healthy { "healthy" } else { "unhealthy" },
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "backfill": health.backfill,
            "database": health.database,
        })),
    )
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub entity: String,
    pub job_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub priority: Option<i32>,
    /// Recompute even when the cached result is up to date.
    #[serde(default)]
    pub force: bool,
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse> {
    let job_type: JobType = req.job_type.parse()?;
    let result = state
        .service
        .submit_job(
            &req.entity,
            job_type,
            req.parameters,
            req.priority.map(JobPriority),
            req.force,
        )
        .await?;

    let status = if result.enqueue.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(result))))
}

#[derive(Debug, Deserialize)]
pub struct PullJobRequest {
    pub worker_size: WorkerSizeClass,
    /// Omitted means every job type the size class may run.
    pub job_types: Option<Vec<String>>,
}

/// A claimed job plus the token its report must carry.
#[derive(Debug, Serialize)]
pub struct PulledJob {
    #[serde(flatten)]
    pub job: QueueEntry,
    pub claim: ClaimToken,
}

pub async fn pull_job(
    State(state): State<AppState>,
    Json(req): Json<PullJobRequest>,
) -> Result<Response> {
    let job_types = req
        .job_types
        .map(|names| {
            names
                .iter()
                .map(|name| name.parse::<JobType>())
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    match state.service.pull(req.worker_size, job_types).await? {
        Some(job) => {
            let claim = job.claim_token().ok_or_else(|| {
                DsqError::internal(format!("claimed job {} has no start time", job.key))
            })?;
            Ok(Json(ApiResponse::success(PulledJob { job, claim })).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportJobRequest {
    pub claim: ClaimToken,
    pub outcome: JobOutcome,
}

#[derive(Debug, Serialize)]
pub struct ReportJobResponse {
    pub key: JobKey,
    pub disposition: ReportDisposition,
}

pub async fn report_job(
    State(state): State<AppState>,
    Json(req): Json<ReportJobRequest>,
) -> Result<impl IntoResponse> {
    let disposition = state.service.report(&req.claim, req.outcome).await?;
    Ok(Json(ApiResponse::success(ReportJobResponse {
        key: req.claim.key,
        disposition,
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    pub entity: String,
    pub job_type: String,
    /// JSON-encoded parameters object.
    pub params: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<CacheEntry>,
    /// Set when the lookup scheduled (or found pending) a computation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<crate::jobs::JobId>,
}

/// Fresh results are served with 200; anything else schedules a job and
/// answers 202 with the last known entry, if any.
pub async fn get_cached(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Result<impl IntoResponse> {
    let job_type: JobType = query.job_type.parse()?;
    let parameters = match query.params.as_deref() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
            .map_err(|e| DsqError::validation(format!("params is not valid JSON: {}", e)))?,
        _ => serde_json::Value::Null,
    };

    let lookup = state
        .service
        .get_or_schedule(&query.entity, job_type, parameters)
        .await?;

    let (status, body) = match lookup {
        GetOrSchedule::Fresh { entry } => (
            StatusCode::OK,
            CacheResponse {
                fresh: true,
                entry: Some(entry),
                job_id: None,
            },
        ),
        GetOrSchedule::Pending {
            last_known,
            enqueue,
        } => (
            StatusCode::ACCEPTED,
            CacheResponse {
                fresh: false,
                entry: last_known,
                job_id: Some(enqueue.job_id()),
            },
        ),
    };
    Ok((status, Json(ApiResponse::success(body))))
}

pub async fn invalidate_entity(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let revision = state.service.invalidate(&entity).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "entity": entity,
        "revision": revision,
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admin and Queue Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// An empty body runs the default scope (retryable errors only).
pub async fn run_backfill(
    State(state): State<AppState>,
    body: Option<Json<BackfillScope>>,
) -> Result<impl IntoResponse> {
    let scope = body.map(|Json(scope)| scope).unwrap_or_default();
    let report = state.service.backfill(scope).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn queue_depth(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let depth = state.service.depth().await?;
    Ok(Json(ApiResponse::success(depth)))
}
