//! Integration tests for the queue and dispatcher over in-memory stores.
//!
//! Tests cover:
//! - Dispatch ordering (priority, then FIFO) and size-class routing
//! - Unicity under concurrent enqueue and claim
//! - Retry bound and the exhausted terminal outcome
//! - Lease reclaim
//! - Staleness after invalidation and children enqueued on success

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsq_core::cache::{CacheOutcome, GetOrSchedule, ResultCache};
use dsq_core::error::{self, DsqError, ErrorCode};
use dsq_core::jobs::{
    CapabilityTable, ClaimFilter, ClaimToken, Dispatcher, EnqueueOutcome, InMemoryQueueBackend,
    JobError, JobErrorKind, JobId, JobKey, JobOutcome, QueueBackend, QueueDepth, QueueEntry,
    Revision, StatusCount, JobPriority, JobQueue, JobStatus, JobType, ReportDisposition, RetryPolicy,
    WorkerSizeClass, CONNECTION_ERROR_CODE, CRASHED_ERROR_CODE,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(600);

fn dispatcher() -> Dispatcher {
    Dispatcher::new(JobQueue::in_memory(), ResultCache::in_memory(), LEASE)
}

fn dispatcher_with_attempts(max_attempts: u32) -> Dispatcher {
    let queue = JobQueue::new(
        Arc::new(InMemoryQueueBackend::new()),
        Arc::new(CapabilityTable::builtin()),
        RetryPolicy {
            max_attempts,
            ..Default::default()
        },
    );
    Dispatcher::new(queue, ResultCache::in_memory(), LEASE)
}

async fn enqueue(d: &Dispatcher, entity: &str, job_type: JobType, priority: JobPriority) -> JobKey {
    let key = JobKey::new(entity, job_type, &json!({}));
    let size = d.queue().capabilities().default_size(job_type);
    d.queue()
        .enqueue(key.clone(), json!({}), priority, size)
        .await
        .unwrap();
    key
}

fn transient() -> JobOutcome {
    JobError::transient(CONNECTION_ERROR_CODE, "connection reset by peer").into()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_splits_transient_then_success() {
    let d = dispatcher();
    let key = enqueue(&d, "ds1", JobType::Splits, JobPriority(5)).await;
    let size = d.queue().capabilities().default_size(JobType::Splits);

    let claimed = d.claim_next(size, &[JobType::Splits]).await.unwrap().unwrap();
    assert_eq!(claimed.key, key);
    assert_eq!(claimed.status, JobStatus::Started);

    let disposition = d
        .report_outcome(&claimed.claim_token().unwrap(), transient())
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Requeued);
    let waiting = d.queue().get(&key).await.unwrap().unwrap();
    assert_eq!(waiting.status, JobStatus::Waiting);
    assert_eq!(waiting.attempt_count, 1);
    assert_eq!(waiting.priority, JobPriority(5));

    let retry = d.claim_next(size, &[JobType::Splits]).await.unwrap().unwrap();
    assert_eq!(retry.key, key);
    let disposition = d
        .report_outcome(
            &retry.claim_token().unwrap(),
            JobOutcome::success(json!({"splits": ["train", "test"]})),
        )
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Completed);

    assert!(d.queue().get(&key).await.unwrap().is_none());
    let cached = d.cache().get(&key).await.unwrap().unwrap();
    assert!(cached.fresh);
    assert!(cached.entry.outcome.is_success());
    assert_eq!(cached.entry.attempts, 2);
}

#[tokio::test]
async fn test_success_enqueues_children() {
    let d = dispatcher();
    let key = enqueue(&d, "ds1", JobType::Splits, JobPriority(7)).await;
    let size = d.queue().capabilities().default_size(JobType::Splits);
    let claimed = d.claim_next(size, &[JobType::Splits]).await.unwrap().unwrap();
    d.report_outcome(&claimed.claim_token().unwrap(), JobOutcome::success(json!({})))
        .await
        .unwrap();

    for child in d.queue().capabilities().children(JobType::Splits) {
        let child_key = JobKey::from_parts("ds1", child, key.fingerprint.clone());
        let entry = d.queue().get(&child_key).await.unwrap().unwrap();
        assert_eq!(entry.priority, JobPriority(7));
        assert_eq!(entry.worker_size, d.queue().capabilities().default_size(child));
    }
}

// ============================================================================
// Ordering and Routing
// ============================================================================

#[tokio::test]
async fn test_priority_then_fifo() {
    let d = dispatcher();
    let first = enqueue(&d, "a", JobType::ConfigNames, JobPriority::NORMAL).await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = enqueue(&d, "b", JobType::ConfigNames, JobPriority::NORMAL).await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    let urgent = enqueue(&d, "c", JobType::ConfigNames, JobPriority::HIGH).await;

    let size = WorkerSizeClass::Light;
    let types = [JobType::ConfigNames];
    let order: Vec<JobKey> = vec![
        d.claim_next(size, &types).await.unwrap().unwrap().key,
        d.claim_next(size, &types).await.unwrap().unwrap().key,
        d.claim_next(size, &types).await.unwrap().unwrap().key,
    ];
    assert_eq!(order, vec![urgent, first, second]);
    assert!(d.claim_next(size, &types).await.unwrap().is_none());
}

#[tokio::test]
async fn test_size_class_routing() {
    let d = dispatcher();
    enqueue(&d, "ds", JobType::Statistics, JobPriority::NORMAL).await;

    assert!(d
        .claim_next(WorkerSizeClass::Light, &JobType::ALL)
        .await
        .unwrap()
        .is_none());
    let claimed = d
        .claim_next(WorkerSizeClass::Heavy, &JobType::ALL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.job_type(), JobType::Statistics);
}

#[tokio::test]
async fn test_disallowed_size_rejected_on_enqueue() {
    let d = dispatcher();
    let key = JobKey::new("ds", JobType::Statistics, &json!({}));
    let err = d
        .queue()
        .enqueue(key, json!({}), JobPriority::NORMAL, WorkerSizeClass::Light)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerSizeNotAllowed);
}

#[tokio::test]
async fn test_empty_job_type_set_claims_nothing() {
    let d = dispatcher();
    enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    assert!(d.claim_next(WorkerSizeClass::Light, &[]).await.unwrap().is_none());
}

// ============================================================================
// Unicity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_submit_creates_one_entry() {
    let d = dispatcher();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            let key = JobKey::new("ds", JobType::Splits, &json!({"config": "default"}));
            d.queue()
                .enqueue(key, json!({"config": "default"}), JobPriority::NORMAL, WorkerSizeClass::Light)
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let created = outcomes.iter().filter(|o| o.is_created()).count();
    assert_eq!(created, 1);
    let id = outcomes[0].job_id();
    assert!(outcomes.iter().all(|o| o.job_id() == id));
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, EnqueueOutcome::AlreadyPending(_))));
    assert_eq!(d.queue().len().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim() {
    let d = dispatcher();
    enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
                .await
                .unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn test_enqueue_while_started_is_pending() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();

    let again = d
        .queue()
        .enqueue(key, json!({}), JobPriority::HIGH, WorkerSizeClass::Light)
        .await
        .unwrap();
    assert!(!again.is_created());
}

// ============================================================================
// Retries and Leases
// ============================================================================

#[tokio::test]
async fn test_retry_bound() {
    let d = dispatcher_with_attempts(3);
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;

    let mut dispositions = Vec::new();
    loop {
        let Some(claimed) = d
            .claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
            .await
            .unwrap()
        else {
            break;
        };
        let claim = claimed.claim_token().unwrap();
        dispositions.push(d.report_outcome(&claim, transient()).await.unwrap());
    }

    assert_eq!(
        dispositions,
        vec![
            ReportDisposition::Requeued,
            ReportDisposition::Requeued,
            ReportDisposition::Requeued,
            ReportDisposition::Exhausted,
        ]
    );
    assert!(d.queue().is_empty().await.unwrap());

    let entry = d.cache().get(&key).await.unwrap().unwrap().entry;
    assert!(!entry.outcome.is_retryable_error());
    match entry.outcome {
        CacheOutcome::Error {
            kind,
            ref code,
            retryable,
            ..
        } => {
            assert_eq!(kind, JobErrorKind::Exhausted);
            assert_eq!(code, CONNECTION_ERROR_CODE);
            assert!(!retryable);
        }
        other => panic!("expected an error entry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_permanent_error_is_terminal() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    let claimed = d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();

    let disposition = d
        .report_outcome(&claimed.claim_token().unwrap(), JobError::permanent("DatasetWithTooManyConfigsError", "too many").into())
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Failed);
    assert!(d.queue().is_empty().await.unwrap());
    assert_eq!(
        d.cache().get(&key).await.unwrap().unwrap().entry.outcome.error_code(),
        Some("DatasetWithTooManyConfigsError")
    );
}

#[tokio::test]
async fn test_infrastructure_error_writes_nothing() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    let claimed = d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();

    let disposition = d
        .report_outcome(&claimed.claim_token().unwrap(), JobError::infrastructure("StoreUnavailable", "down").into())
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Deferred);
    assert!(d.cache().get(&key).await.unwrap().is_none());
    assert_eq!(
        d.queue().get(&key).await.unwrap().unwrap().status,
        JobStatus::Started
    );
}

#[tokio::test]
async fn test_report_for_unclaimed_job_rejected() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    let waiting = d.queue().get(&key).await.unwrap().unwrap();
    assert!(waiting.claim_token().is_none());

    let forged = ClaimToken {
        key: key.clone(),
        job_id: waiting.id,
        started_at: Utc::now(),
    };
    let err = d
        .report_outcome(&forged, JobOutcome::success(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotStarted);

    let unknown = ClaimToken {
        key: JobKey::new("other", JobType::ConfigNames, &json!({})),
        job_id: JobId::new(),
        started_at: Utc::now(),
    };
    let err = d
        .report_outcome(&unknown, JobOutcome::success(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotStarted);
}

#[tokio::test]
async fn test_lease_reclaim_increments_attempt_once() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();

    // Not expired yet
    let report = d.reclaim_expired(Utc::now()).await.unwrap();
    assert_eq!(report.requeued, 0);

    let later = Utc::now() + chrono::Duration::hours(1);
    let report = d.reclaim_expired(later).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.exhausted, 0);

    let entry = d.queue().get(&key).await.unwrap().unwrap();
    assert_eq!(entry.status, JobStatus::Waiting);
    assert_eq!(entry.attempt_count, 1);
    assert!(entry.started_at.is_none());

    // A second pass finds nothing Started
    let report = d.reclaim_expired(later).await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(d.queue().get(&key).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn test_lease_reclaim_over_budget_caches_crash() {
    let d = dispatcher_with_attempts(0);
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();

    let report = d
        .reclaim_expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.exhausted, 1);
    assert!(d.queue().is_empty().await.unwrap());
    assert_eq!(
        d.cache().get(&key).await.unwrap().unwrap().entry.outcome.error_code(),
        Some(CRASHED_ERROR_CODE)
    );
}

#[tokio::test]
async fn test_late_report_after_reclaim_rejected() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    let first = d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();
    let stale_claim = first.claim_token().unwrap();
    d.reclaim_expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    let err = d
        .report_outcome(&stale_claim, JobOutcome::success(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotStarted);

    // The same job claimed again still refuses the first claim's report
    d.cache().invalidate("ds").await.unwrap();
    let second = d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.revision, Some(1));
    let err = d
        .report_outcome(&stale_claim, JobOutcome::success(json!({"from": "first"})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotStarted);
    assert_eq!(
        d.queue().get(&key).await.unwrap().unwrap().status,
        JobStatus::Started
    );

    let disposition = d
        .report_outcome(&second.claim_token().unwrap(), JobOutcome::success(json!({"from": "second"})))
        .await
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Completed);
    let cached = d.cache().get(&key).await.unwrap().unwrap();
    assert!(cached.fresh);
    assert_eq!(cached.entry.revision, 1);
}

// ============================================================================
// Staleness
// ============================================================================

#[tokio::test]
async fn test_invalidate_makes_entries_stale() {
    let d = dispatcher();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    let claimed = d.claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();
    d.report_outcome(&claimed.claim_token().unwrap(), JobOutcome::success(json!({"configs": ["default"]})))
        .await
        .unwrap();
    assert!(d.cache().get(&key).await.unwrap().unwrap().fresh);

    let revision = d.cache().invalidate("ds").await.unwrap();
    assert_eq!(revision, 1);
    let cached = d.cache().get(&key).await.unwrap().unwrap();
    assert!(!cached.fresh);

    let lookup = d
        .cache()
        .get_or_schedule(d.queue(), key.clone(), json!({}), WorkerSizeClass::Light, JobPriority::NORMAL)
        .await
        .unwrap();
    match lookup {
        GetOrSchedule::Pending { last_known, enqueue } => {
            assert!(last_known.is_some());
            assert!(enqueue.is_created());
        }
        GetOrSchedule::Fresh { .. } => panic!("stale entry served as fresh"),
    }
}

#[tokio::test]
async fn test_claim_stamps_current_revision() {
    let d = dispatcher();
    d.cache().invalidate("ds").await.unwrap();
    d.cache().invalidate("ds").await.unwrap();
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;

    let claimed = d
        .claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.revision, Some(2));

    // Invalidated while running: the result lands already stale
    d.cache().invalidate("ds").await.unwrap();
    d.report_outcome(&claimed.claim_token().unwrap(), JobOutcome::success(json!({})))
        .await
        .unwrap();
    let cached = d.cache().get(&key).await.unwrap().unwrap();
    assert_eq!(cached.entry.revision, 2);
    assert!(!cached.fresh);
}

#[tokio::test]
async fn test_runner_upgrade_makes_entries_stale() {
    let cache = ResultCache::in_memory();
    let key = JobKey::new("ds", JobType::Splits, &json!({}));
    let current = CapabilityTable::builtin().runner_version(JobType::Splits);
    cache
        .put(key.clone(), json!({}), CacheOutcome::success(json!({}), Utc::now()), 0, current - 1, 1)
        .await
        .unwrap();

    assert!(!cache.get(&key).await.unwrap().unwrap().fresh);
}

// ============================================================================
// Store Failures
// ============================================================================

/// Fails every insert once `reject_inserts` is set.
#[derive(Default)]
struct RejectingInserts {
    inner: InMemoryQueueBackend,
    reject_inserts: AtomicBool,
}

#[async_trait]
impl QueueBackend for RejectingInserts {
    async fn insert_if_absent(&self, entry: QueueEntry) -> error::Result<EnqueueOutcome> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(DsqError::internal("queue store rejected insert"));
        }
        self.inner.insert_if_absent(entry).await
    }

    async fn claim(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> error::Result<Option<QueueEntry>> {
        self.inner.claim(filter, now).await
    }

    async fn stamp_revision(&self, key: &JobKey, revision: Revision) -> error::Result<()> {
        self.inner.stamp_revision(key, revision).await
    }

    async fn get(&self, key: &JobKey) -> error::Result<Option<QueueEntry>> {
        self.inner.get(key).await
    }

    async fn requeue(&self, key: &JobKey, started_at: DateTime<Utc>) -> error::Result<bool> {
        self.inner.requeue(key, started_at).await
    }

    async fn complete(&self, key: &JobKey, started_at: DateTime<Utc>) -> error::Result<bool> {
        self.inner.complete(key, started_at).await
    }

    async fn expired_leases(&self, started_before: DateTime<Utc>) -> error::Result<Vec<QueueEntry>> {
        self.inner.expired_leases(started_before).await
    }

    async fn waiting_depths(&self) -> error::Result<Vec<QueueDepth>> {
        self.inner.waiting_depths().await
    }

    async fn status_counts(&self) -> error::Result<Vec<StatusCount>> {
        self.inner.status_counts().await
    }

    async fn len(&self) -> error::Result<usize> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn test_child_enqueue_failure_still_completes() {
    let backend = Arc::new(RejectingInserts::default());
    let queue = JobQueue::new(
        backend.clone(),
        Arc::new(CapabilityTable::builtin()),
        RetryPolicy::default(),
    );
    let d = Dispatcher::new(queue, ResultCache::in_memory(), LEASE);
    let key = enqueue(&d, "ds", JobType::ConfigNames, JobPriority::NORMAL).await;
    let claimed = d
        .claim_next(WorkerSizeClass::Light, &[JobType::ConfigNames])
        .await
        .unwrap()
        .unwrap();

    backend.reject_inserts.store(true, Ordering::SeqCst);
    let disposition = d
        .report_outcome(&claimed.claim_token().unwrap(), JobOutcome::success(json!({})))
        .await
        .unwrap();

    assert_eq!(disposition, ReportDisposition::Completed);
    assert!(d.queue().is_empty().await.unwrap());
    assert!(d.cache().get(&key).await.unwrap().unwrap().fresh);
}
