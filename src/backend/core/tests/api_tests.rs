//! HTTP API tests against the in-memory service.
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use dsq_core::api::{build_router, AppState};
use dsq_core::config::Config;
use dsq_core::service::JobService;
use dsq_core::telemetry::MetricsRegistry;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let service = JobService::in_memory(&Config::default()).unwrap();
    build_router(AppState {
        service,
        metrics: MetricsRegistry::disabled(),
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn test_submit_is_deduplicated() {
    let app = app();
    let body = json!({
        "entity": "user/dataset",
        "job_type": "/splits",
        "parameters": {"config": "default"},
    });

    let (status, created) = send(&app, Method::POST, "/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["enqueue"]["result"], "created");
    assert_eq!(created["data"]["worker_size"], "light");

    let (status, pending) = send(&app, Method::POST, "/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["data"]["enqueue"]["result"], "already_pending");
    assert_eq!(
        pending["data"]["enqueue"]["job_id"],
        created["data"]["enqueue"]["job_id"]
    );
}

#[tokio::test]
async fn test_submit_unknown_job_type_is_unprocessable() {
    let app = app();
    let body = json!({"entity": "user/dataset", "job_type": "/nope"});

    let (status, error) = send(&app, Method::POST, "/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["success"], false);
    assert_eq!(error["error"]["code"], "UNKNOWN_JOB_TYPE");
}

#[tokio::test]
async fn test_pull_then_report_success() {
    let app = app();
    let submit = json!({"entity": "user/dataset", "job_type": "/config-names"});
    send(&app, Method::POST, "/jobs", Some(submit)).await;

    let (status, pulled) = send(
        &app,
        Method::POST,
        "/jobs/pull",
        Some(json!({"worker_size": "light"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pulled["data"]["status"], "started");
    assert_eq!(pulled["data"]["key"]["job_type"], "/config-names");
    let claim = pulled["data"]["claim"].clone();
    assert_eq!(claim["key"], pulled["data"]["key"]);
    assert_eq!(claim["job_id"], pulled["data"]["id"]);

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/pull",
        Some(json!({"worker_size": "light", "job_types": ["/config-names"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let report = json!({
        "claim": claim,
        "outcome": {"status": "success", "payload": {"config_names": ["default"]}},
    });
    let (status, reported) = send(&app, Method::POST, "/jobs/report", Some(report)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reported["data"]["disposition"], "completed");

    let (status, cached) = send(
        &app,
        Method::GET,
        "/cache?entity=user%2Fdataset&job_type=%2Fconfig-names",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cached["data"]["fresh"], true);
    assert_eq!(
        cached["data"]["entry"]["outcome"]["payload"]["config_names"][0],
        "default"
    );

    // Success enqueued the children
    let (_, depth) = send(&app, Method::GET, "/queue/depth", None).await;
    let waiting = depth["data"]["waiting"].as_array().unwrap();
    assert!(waiting
        .iter()
        .any(|d| d["job_type"] == "/split-names" && d["waiting"] == 1));
    assert!(waiting.iter().any(|d| d["job_type"] == "/parquet"));
}

#[tokio::test]
async fn test_report_for_unclaimed_job_conflicts() {
    let app = app();
    let report = json!({
        "claim": {
            "key": {"entity_id": "ghost", "job_type": "/splits", "fingerprint": "00"},
            "job_id": "00000000-0000-0000-0000-000000000000",
            "started_at": "2024-01-01T00:00:00Z",
        },
        "outcome": {"status": "success", "payload": {}},
    });

    let (status, error) = send(&app, Method::POST, "/jobs/report", Some(report)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["code"], "JOB_NOT_STARTED");
}

#[tokio::test]
async fn test_resubmit_after_success_needs_force() {
    let app = app();
    let submit = json!({"entity": "user/dataset", "job_type": "/config-names"});
    let pull = json!({"worker_size": "light", "job_types": ["/config-names"]});
    send(&app, Method::POST, "/jobs", Some(submit.clone())).await;
    let (_, pulled) = send(&app, Method::POST, "/jobs/pull", Some(pull.clone())).await;
    let report = json!({
        "claim": pulled["data"]["claim"],
        "outcome": {"status": "success", "payload": {}},
    });
    let (status, _) = send(&app, Method::POST, "/jobs/report", Some(report)).await;
    assert_eq!(status, StatusCode::OK);

    // Up to date: accepted, then completed at claim without running
    let (status, _) = send(&app, Method::POST, "/jobs", Some(submit)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, Method::POST, "/jobs/pull", Some(pull.clone())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let forced = json!({"entity": "user/dataset", "job_type": "/config-names", "force": true});
    let (status, _) = send(&app, Method::POST, "/jobs", Some(forced)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, pulled) = send(&app, Method::POST, "/jobs/pull", Some(pull)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pulled["data"]["force"], true);
}

// ============================================================================
// Cache, Invalidation and Backfill
// ============================================================================

#[tokio::test]
async fn test_cache_miss_schedules_and_answers_accepted() {
    let app = app();
    let uri = "/cache?entity=ds&job_type=%2Fsplits&params=%7B%22config%22%3A%22default%22%7D";

    let (status, first) = send(&app, Method::GET, uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["data"]["fresh"], false);
    assert!(first["data"].get("entry").is_none());
    let job_id = first["data"]["job_id"].clone();
    assert!(job_id.is_string());

    let (status, second) = send(&app, Method::GET, uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["data"]["job_id"], job_id);
}

#[tokio::test]
async fn test_cache_rejects_malformed_params() {
    let app = app();
    let (status, _) = send(
        &app,
        Method::GET,
        "/cache?entity=ds&job_type=%2Fsplits&params=not-json",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_invalidate_bumps_revision() {
    let app = app();
    let (status, first) = send(&app, Method::POST, "/entities/ds/invalidate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["entity"], "ds");
    assert_eq!(first["data"]["revision"], 1);

    let (_, second) = send(&app, Method::POST, "/entities/ds/invalidate", None).await;
    assert_eq!(second["data"]["revision"], 2);
}

#[tokio::test]
async fn test_backfill_without_body_runs_default_scope() {
    let app = app();
    let (status, report) = send(&app, Method::POST, "/admin/backfill", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["data"]["outcome"], "completed");
    assert_eq!(report["data"]["scanned"], 0);
    assert_eq!(report["data"]["enqueued"], 0);
}

// ============================================================================
// Health and Depth
// ============================================================================

#[tokio::test]
async fn test_health_without_database() {
    let app = app();
    let (status, health) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["backfill"], "idle");
    assert!(health["database"].is_null());
}

#[tokio::test]
async fn test_depth_of_empty_queue() {
    let app = app();
    let (status, depth) = send(&app, Method::GET, "/queue/depth", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(depth["success"], true);
    assert!(depth["data"]["waiting"].is_array());
    assert!(depth["data"]["statuses"].is_array());
    assert!(depth["data"]["cache"].is_array());
}
