//! Dispatcher: hands jobs to workers and applies their outcomes.
//!
//! Outcome handling writes the cache first and moves the queue entry second.
//! If the cache write fails the entry stays Started and is picked up again by
//! the lease reclaim.
//!
//! Reports carry the [`ClaimToken`] issued at claim time. A report whose
//! claim was reclaimed, even if the entry was claimed again since, is
//! rejected with `JobNotStarted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::job::{
    ClaimToken, JobError, JobErrorKind, JobKey, JobOutcome, JobType, QueueEntry, WorkerSizeClass,
    CRASHED_ERROR_CODE,
};
use super::queue::{ClaimFilter, JobQueue};
use crate::cache::{CacheOutcome, ResultCache};
use crate::error::{DsqError, Result};
use crate::telemetry::metrics::QueueMetrics;

/// What happened to a reported job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportDisposition {
    /// Success cached, entry deleted, children enqueued.
    Completed,
    /// Retryable error cached, entry back to Waiting.
    Requeued,
    /// Retry budget spent, terminal error cached, entry deleted.
    Exhausted,
    /// Permanent error cached, entry deleted.
    Failed,
    /// Infrastructure error, nothing written; the lease will reclaim the entry.
    Deferred,
}

impl ReportDisposition {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Requeued => "requeued",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }
}

/// Result of one lease-reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub requeued: u64,
    pub exhausted: u64,
}

/// Claims, reports and lease reclaim over a queue and a cache.
#[derive(Clone)]
pub struct Dispatcher {
    queue: JobQueue,
    cache: ResultCache,
    lease_timeout: Duration,
}

impl Dispatcher {
    pub fn new(queue: JobQueue, cache: ResultCache, lease_timeout: Duration) -> Self {
        Self {
            queue,
            cache,
            lease_timeout,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Claim the next eligible job and stamp the entity revision on it.
    ///
    /// Unforced entries whose cached result is already up to date are
    /// completed without being handed out.
    #[instrument(skip(self, job_types), fields(worker_size = %worker_size))]
    pub async fn claim_next(
        &self,
        worker_size: WorkerSizeClass,
        job_types: &[JobType],
    ) -> Result<Option<QueueEntry>> {
        let filter = ClaimFilter::new(worker_size, job_types.to_vec());
        let entry = loop {
            let Some(mut entry) = self.queue.claim(&filter).await? else {
                return Ok(None);
            };
            let revision = self.cache.current_revision(&entry.key.entity_id).await?;
            self.queue.stamp_revision(&entry.key, revision).await?;
            entry.revision = Some(revision);

            if entry.force || !self.is_up_to_date(&entry).await? {
                break entry;
            }
            self.skip(&entry).await?;
        };
        let revision = entry.revision.unwrap_or_default();

        let waited = entry
            .started_at
            .map(|t| (t - entry.created_at).to_std().unwrap_or_default())
            .unwrap_or_default();
        QueueMetrics::record_claimed(entry.job_type(), worker_size, waited);
        debug!(
            entity = %entry.key.entity_id,
            job_type = %entry.job_type(),
            attempt = entry.attempt_count,
            revision,
            "Job claimed"
        );
        Ok(Some(entry))
    }

    /// Apply a worker's outcome to the claim `claim` was issued for.
    #[instrument(
        skip(self, claim, outcome),
        fields(entity = %claim.key.entity_id, job_type = %claim.key.job_type)
    )]
    pub async fn report_outcome(
        &self,
        claim: &ClaimToken,
        outcome: JobOutcome,
    ) -> Result<ReportDisposition> {
        let key = &claim.key;
        let entry = match self.queue.get(key).await? {
            Some(entry) if entry.is_claimed_by(claim) => entry,
            _ => return Err(DsqError::job_not_started(key)),
        };
        let started_at = claim.started_at;

        let disposition = match outcome {
            JobOutcome::Success { payload } => {
                self.write(&entry, CacheOutcome::success(payload, Utc::now()))
                    .await?;
                self.finish(&entry, started_at).await?;
                if let Err(e) = self.enqueue_children(&entry).await {
                    warn!(error = %e, "Success recorded but child jobs could not be enqueued");
                }
                ReportDisposition::Completed
            }
            JobOutcome::Error(error) => match error.kind {
                JobErrorKind::Infrastructure => {
                    warn!(
                        code = %error.code,
                        message = %error.message,
                        "Infrastructure error reported, leaving job for lease reclaim"
                    );
                    ReportDisposition::Deferred
                }
                JobErrorKind::Transient if self.queue.retry_policy().should_requeue(entry.attempt_count) => {
                    self.write(&entry, CacheOutcome::error(error, Utc::now()))
                        .await?;
                    if !self.queue.requeue(key, started_at).await? {
                        warn!("Job changed state before requeue");
                    }
                    ReportDisposition::Requeued
                }
                JobErrorKind::Transient | JobErrorKind::Exhausted => {
                    self.write(&entry, CacheOutcome::error(error.exhausted(), Utc::now()))
                        .await?;
                    self.finish(&entry, started_at).await?;
                    ReportDisposition::Exhausted
                }
                JobErrorKind::Permanent => {
                    self.write(&entry, CacheOutcome::error(error, Utc::now()))
                        .await?;
                    self.finish(&entry, started_at).await?;
                    ReportDisposition::Failed
                }
            },
        };

        QueueMetrics::record_finished(key.job_type, disposition.as_str());
        info!(
            disposition = disposition.as_str(),
            attempt = entry.attempt_count,
            "Job outcome recorded"
        );
        Ok(disposition)
    }

    /// Reclaim Started jobs whose lease ran out at `now`.
    ///
    /// Under budget the entry goes back to Waiting with one more attempt.
    /// Otherwise a terminal crash error is cached and the entry deleted.
    #[instrument(skip(self))]
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let lease = chrono::Duration::from_std(self.lease_timeout)
            .map_err(|e| DsqError::configuration(format!("Invalid lease timeout: {}", e)))?;
        let expired = self.queue.expired_leases(now - lease).await?;

        let mut report = ReclaimReport::default();
        for entry in expired {
            let Some(started_at) = entry.started_at else {
                continue;
            };

            if self.queue.retry_policy().should_requeue(entry.attempt_count) {
                if self.queue.requeue(&entry.key, started_at).await? {
                    report.requeued += 1;
                    QueueMetrics::record_lease_reclaimed(entry.job_type(), false);
                    warn!(
                        entity = %entry.key.entity_id,
                        job_type = %entry.job_type(),
                        attempt = entry.attempt_count + 1,
                        "Lease expired, job requeued"
                    );
                }
            } else {
                let error = JobError::transient(
                    CRASHED_ERROR_CODE,
                    "The job runner crashed or stopped reporting before completing the job",
                )
                .exhausted();
                self.write(&entry, CacheOutcome::error(error, now)).await?;
                if self.queue.complete(&entry.key, started_at).await? {
                    report.exhausted += 1;
                    QueueMetrics::record_lease_reclaimed(entry.job_type(), true);
                    warn!(
                        entity = %entry.key.entity_id,
                        job_type = %entry.job_type(),
                        attempt = entry.attempt_count,
                        "Lease expired with retry budget spent, job dropped"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Cached result at the claimed revision and current runner version that
    /// a rerun would not change.
    async fn is_up_to_date(&self, entry: &QueueEntry) -> Result<bool> {
        Ok(match self.cache.get(&entry.key).await? {
            Some(cached) => cached.fresh && !cached.entry.outcome.is_retryable_error(),
            None => false,
        })
    }

    async fn skip(&self, entry: &QueueEntry) -> Result<()> {
        if let Some(started_at) = entry.started_at {
            if self.queue.complete(&entry.key, started_at).await? {
                QueueMetrics::record_finished(entry.job_type(), "skipped");
                debug!(
                    entity = %entry.key.entity_id,
                    job_type = %entry.job_type(),
                    "Cached result up to date, job skipped"
                );
            }
        }
        Ok(())
    }

    async fn write(&self, entry: &QueueEntry, outcome: CacheOutcome) -> Result<()> {
        let revision = match entry.revision {
            Some(revision) => revision,
            None => self.cache.current_revision(&entry.key.entity_id).await?,
        };
        let runner_version = self
            .queue
            .capabilities()
            .runner_version(entry.job_type());
        self.cache
            .put(
                entry.key.clone(),
                entry.parameters.clone(),
                outcome,
                revision,
                runner_version,
                entry.attempt_count + 1,
            )
            .await?;
        Ok(())
    }

    async fn finish(&self, entry: &QueueEntry, started_at: DateTime<Utc>) -> Result<()> {
        if !self.queue.complete(&entry.key, started_at).await? {
            warn!(
                entity = %entry.key.entity_id,
                job_type = %entry.job_type(),
                "Job changed state before completion"
            );
        }
        Ok(())
    }

    async fn enqueue_children(&self, entry: &QueueEntry) -> Result<()> {
        let capabilities = self.queue.capabilities().clone();
        for child in capabilities.children(entry.job_type()) {
            let key = JobKey::from_parts(
                entry.key.entity_id.clone(),
                child,
                entry.key.fingerprint.clone(),
            );
            let outcome = self
                .queue
                .enqueue(
                    key,
                    entry.parameters.clone(),
                    entry.priority,
                    capabilities.default_size(child),
                )
                .await?;
            debug!(child = %child, created = outcome.is_created(), "Child job enqueued");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::{JobPriority, JobStatus, CONNECTION_ERROR_CODE};
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            JobQueue::in_memory(),
            ResultCache::in_memory(),
            Duration::from_secs(600),
        )
    }

    async fn enqueue_and_claim(d: &Dispatcher, job_type: JobType) -> QueueEntry {
        let key = JobKey::new("ds", job_type, &json!({}));
        let size = d.queue().capabilities().default_size(job_type);
        d.queue()
            .enqueue(key, json!({}), JobPriority::NORMAL, size)
            .await
            .unwrap();
        d.claim_next(size, &[job_type]).await.unwrap().unwrap()
    }

    fn token(entry: &QueueEntry) -> ClaimToken {
        entry.claim_token().unwrap()
    }

    #[tokio::test]
    async fn test_report_without_claim_is_rejected() {
        let d = dispatcher();
        let key = JobKey::new("ds", JobType::Splits, &json!({}));
        let never_claimed = ClaimToken {
            key: key.clone(),
            job_id: crate::jobs::JobId::new(),
            started_at: Utc::now(),
        };
        let err = d
            .report_outcome(&never_claimed, JobOutcome::success(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotStarted);

        d.queue()
            .enqueue(key.clone(), json!({}), JobPriority::NORMAL, WorkerSizeClass::Light)
            .await
            .unwrap();
        let err = d
            .report_outcome(&never_claimed, JobOutcome::success(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotStarted);
        assert!(d.cache().get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_stamps_revision() {
        let d = dispatcher();
        d.cache().invalidate("ds").await.unwrap();
        let entry = enqueue_and_claim(&d, JobType::Splits).await;
        assert_eq!(entry.revision, Some(1));
        assert_eq!(entry.status, JobStatus::Started);
    }

    #[tokio::test]
    async fn test_success_enqueues_children() {
        let d = dispatcher();
        let entry = enqueue_and_claim(&d, JobType::ConfigNames).await;
        let disposition = d
            .report_outcome(&token(&entry), JobOutcome::success(json!({"configs": ["default"]})))
            .await
            .unwrap();
        assert_eq!(disposition, ReportDisposition::Completed);
        assert!(d.queue().get(&entry.key).await.unwrap().is_none());

        let split_names = JobKey::new("ds", JobType::SplitNames, &json!({}));
        let parquet = JobKey::new("ds", JobType::Parquet, &json!({}));
        assert!(d.queue().get(&split_names).await.unwrap().is_some());
        let parquet_entry = d.queue().get(&parquet).await.unwrap().unwrap();
        assert_eq!(parquet_entry.worker_size, WorkerSizeClass::Heavy);
        assert_eq!(parquet_entry.priority, JobPriority::NORMAL);
    }

    #[tokio::test]
    async fn test_permanent_error_is_cached_and_dropped() {
        let d = dispatcher();
        let entry = enqueue_and_claim(&d, JobType::Splits).await;
        let disposition = d
            .report_outcome(
                &token(&entry),
                JobError::permanent("UnsupportedFormat", "cannot read").into(),
            )
            .await
            .unwrap();
        assert_eq!(disposition, ReportDisposition::Failed);
        assert!(d.queue().get(&entry.key).await.unwrap().is_none());

        let cached = d.cache().get(&entry.key).await.unwrap().unwrap();
        assert!(!cached.entry.outcome.is_retryable_error());
        assert_eq!(cached.entry.outcome.error_code(), Some("UnsupportedFormat"));
    }

    #[tokio::test]
    async fn test_infrastructure_error_writes_nothing() {
        let d = dispatcher();
        let entry = enqueue_and_claim(&d, JobType::Splits).await;
        let disposition = d
            .report_outcome(&token(&entry), JobError::infrastructure("StoreDown", "db").into())
            .await
            .unwrap();
        assert_eq!(disposition, ReportDisposition::Deferred);
        assert!(d.cache().get(&entry.key).await.unwrap().is_none());

        let still = d.queue().get(&entry.key).await.unwrap().unwrap();
        assert_eq!(still.status, JobStatus::Started);
    }

    #[tokio::test]
    async fn test_transient_error_requeues_until_budget() {
        let d = dispatcher();
        let max = d.queue().retry_policy().max_attempts;
        let key = JobKey::new("ds", JobType::Splits, &json!({}));
        d.queue()
            .enqueue(key.clone(), json!({}), JobPriority::NORMAL, WorkerSizeClass::Light)
            .await
            .unwrap();

        for attempt in 0..max {
            let claimed = d
                .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.attempt_count, attempt);
            let disposition = d
                .report_outcome(
                    &token(&claimed),
                    JobError::transient(CONNECTION_ERROR_CODE, "reset").into(),
                )
                .await
                .unwrap();
            assert_eq!(disposition, ReportDisposition::Requeued);
        }

        let last = d
            .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
            .await
            .unwrap()
            .unwrap();
        let disposition = d
            .report_outcome(
                &token(&last),
                JobError::transient(CONNECTION_ERROR_CODE, "reset").into(),
            )
            .await
            .unwrap();
        assert_eq!(disposition, ReportDisposition::Exhausted);
        assert!(d.queue().get(&key).await.unwrap().is_none());

        let cached = d.cache().get(&key).await.unwrap().unwrap().entry;
        assert_eq!(cached.attempts, max + 1);
        assert_eq!(cached.outcome.kind_label(), "exhausted");
        assert!(!cached.outcome.is_retryable_error());
    }

    #[tokio::test]
    async fn test_reclaim_expired_requeues_once() {
        let d = dispatcher();
        let entry = enqueue_and_claim(&d, JobType::Splits).await;

        let before = d.reclaim_expired(Utc::now()).await.unwrap();
        assert_eq!(before, ReclaimReport::default());

        let later = Utc::now() + chrono::Duration::seconds(601);
        let report = d.reclaim_expired(later).await.unwrap();
        assert_eq!(report.requeued, 1);

        let requeued = d.queue().get(&entry.key).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Waiting);
        assert_eq!(requeued.attempt_count, 1);

        let again = d.reclaim_expired(later).await.unwrap();
        assert_eq!(again, ReclaimReport::default());
    }

    #[tokio::test]
    async fn test_report_from_reclaimed_claim_is_rejected() {
        let d = dispatcher();
        let first = enqueue_and_claim(&d, JobType::Splits).await;
        assert_eq!(first.revision, Some(0));

        d.cache().invalidate("ds").await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(d.reclaim_expired(later).await.unwrap().requeued, 1);
        let second = d
            .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.revision, Some(1));

        let err = d
            .report_outcome(&token(&first), JobOutcome::success(json!({"from": 0})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotStarted);
        assert!(d.cache().get(&first.key).await.unwrap().is_none());

        let disposition = d
            .report_outcome(&token(&second), JobOutcome::success(json!({"from": 1})))
            .await
            .unwrap();
        assert_eq!(disposition, ReportDisposition::Completed);
        let cached = d.cache().get(&first.key).await.unwrap().unwrap();
        assert!(cached.fresh);
        assert_eq!(cached.entry.revision, 1);
        assert!(matches!(
            &cached.entry.outcome,
            CacheOutcome::Success { payload, .. } if payload["from"] == 1
        ));
    }

    #[tokio::test]
    async fn test_up_to_date_job_is_skipped_unless_forced() {
        let d = dispatcher();
        let done = enqueue_and_claim(&d, JobType::Splits).await;
        d.report_outcome(&token(&done), JobOutcome::success(json!({"splits": []})))
            .await
            .unwrap();

        let key = done.key.clone();
        let resubmitted = d
            .queue()
            .enqueue(key.clone(), json!({}), JobPriority::NORMAL, WorkerSizeClass::Light)
            .await
            .unwrap();
        assert!(resubmitted.is_created());
        let claimed = d
            .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert!(d.queue().get(&key).await.unwrap().is_none());
        assert_eq!(d.cache().get(&key).await.unwrap().unwrap().entry.attempts, 1);

        d.queue()
            .enqueue_forced(key.clone(), json!({}), JobPriority::NORMAL, WorkerSizeClass::Light)
            .await
            .unwrap();
        let forced = d
            .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
            .await
            .unwrap()
            .unwrap();
        assert!(forced.force);
        assert_eq!(forced.key, key);
    }

    #[tokio::test]
    async fn test_stale_or_retryable_result_is_not_skipped() {
        let d = dispatcher();
        let failed = enqueue_and_claim(&d, JobType::Splits).await;
        d.report_outcome(
            &token(&failed),
            JobError::transient(CONNECTION_ERROR_CODE, "reset").into(),
        )
        .await
        .unwrap();
        let retry = d
            .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
            .await
            .unwrap()
            .unwrap();
        d.report_outcome(&token(&retry), JobOutcome::success(json!({})))
            .await
            .unwrap();

        d.cache().invalidate("ds").await.unwrap();
        d.queue()
            .enqueue(retry.key.clone(), json!({}), JobPriority::NORMAL, WorkerSizeClass::Light)
            .await
            .unwrap();
        let rerun = d
            .claim_next(WorkerSizeClass::Light, &[JobType::Splits])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rerun.revision, Some(1));
    }
}
