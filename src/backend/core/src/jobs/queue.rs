//! Queue store with unicity per job key and priority-ordered claims.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::capability::CapabilityTable;
use super::job::{
    JobId, JobKey, JobPriority, JobStatus, JobType, QueueEntry, RetryPolicy, Revision,
    WorkerSizeClass,
};
use crate::error::{ErrorCode, Result};
use crate::telemetry::metrics::QueueMetrics;

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new Waiting entry was created.
    Created(JobId),
    /// A non-terminal entry already exists for the key; nothing changed.
    AlreadyPending(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Created(id) | Self::AlreadyPending(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// What a worker can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    pub worker_size: WorkerSizeClass,
    pub job_types: Vec<JobType>,
}

impl ClaimFilter {
    pub fn new(worker_size: WorkerSizeClass, job_types: impl Into<Vec<JobType>>) -> Self {
        Self {
            worker_size,
            job_types: job_types.into(),
        }
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        entry.worker_size == self.worker_size && self.job_types.contains(&entry.job_type())
    }
}

/// Waiting entries for one `(job type, size)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub job_type: JobType,
    pub worker_size: WorkerSizeClass,
    pub waiting: u64,
}

/// Entries for one `(job type, status)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub job_type: JobType,
    pub status: JobStatus,
    pub count: u64,
}

/// Trait for queue backends.
///
/// Every method is atomic on its own. `claim` is the only operation that must
/// exclude concurrent callers; the others are atomic per key.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert `entry` unless a non-terminal entry exists for its key.
    async fn insert_if_absent(&self, entry: QueueEntry) -> Result<EnqueueOutcome>;

    /// Mark the first eligible Waiting entry (dispatch order) as Started.
    async fn claim(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> Result<Option<QueueEntry>>;

    /// Record the entity revision on a Started entry.
    async fn stamp_revision(&self, key: &JobKey, revision: Revision) -> Result<()>;

    /// Current entry for a key.
    async fn get(&self, key: &JobKey) -> Result<Option<QueueEntry>>;

    /// Started → Waiting with `attempt_count + 1`, only if the entry is still
    /// Started at `started_at`.
    async fn requeue(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool>;

    /// Delete a Started entry, only if it is still Started at `started_at`.
    async fn complete(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool>;

    /// Started entries claimed at or before `started_before`.
    async fn expired_leases(&self, started_before: DateTime<Utc>) -> Result<Vec<QueueEntry>>;

    /// Waiting counts grouped by job type and size. Empty groups are omitted.
    async fn waiting_depths(&self) -> Result<Vec<QueueDepth>>;

    /// Counts grouped by job type and status. Empty groups are omitted.
    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Number of non-terminal entries.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory queue backend for tests and single-node development.
pub struct InMemoryQueueBackend {
    entries: Arc<RwLock<HashMap<JobKey, QueueEntry>>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn insert_if_absent(&self, entry: QueueEntry) -> Result<EnqueueOutcome> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&entry.key) {
            return Ok(EnqueueOutcome::AlreadyPending(existing.id));
        }
        let id = entry.id;
        entries.insert(entry.key.clone(), entry);
        Ok(EnqueueOutcome::Created(id))
    }

    async fn claim(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let mut entries = self.entries.write().await;
        let key = entries
            .values()
            .filter(|e| e.status == JobStatus::Waiting && filter.matches(e))
            .min_by(|a, b| a.dispatch_cmp(b))
            .map(|e| e.key.clone());

        Ok(key.and_then(|key| {
            entries.get_mut(&key).map(|entry| {
                entry.status = JobStatus::Started;
                entry.started_at = Some(now);
                entry.clone()
            })
        }))
    }

    async fn stamp_revision(&self, key: &JobKey, revision: Revision) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            if entry.status == JobStatus::Started {
                entry.revision = Some(revision);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &JobKey) -> Result<Option<QueueEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn requeue(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry)
                if entry.status == JobStatus::Started && entry.started_at == Some(started_at) =>
            {
                entry.status = JobStatus::Waiting;
                entry.started_at = None;
                entry.revision = None;
                entry.attempt_count += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let matches = entries
            .get(key)
            .map(|e| e.status == JobStatus::Started && e.started_at == Some(started_at))
            .unwrap_or(false);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn expired_leases(&self, started_before: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.read().await;
        let mut expired: Vec<QueueEntry> = entries
            .values()
            .filter(|e| {
                e.status == JobStatus::Started
                    && e.started_at.map(|t| t <= started_before).unwrap_or(false)
            })
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(expired)
    }

    async fn waiting_depths(&self) -> Result<Vec<QueueDepth>> {
        let entries = self.entries.read().await;
        let mut counts: HashMap<(JobType, WorkerSizeClass), u64> = HashMap::new();
        for entry in entries.values().filter(|e| e.status == JobStatus::Waiting) {
            *counts.entry((entry.job_type(), entry.worker_size)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((job_type, worker_size), waiting)| QueueDepth {
                job_type,
                worker_size,
                waiting,
            })
            .collect())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let entries = self.entries.read().await;
        let mut counts: HashMap<(JobType, JobStatus), u64> = HashMap::new();
        for entry in entries.values() {
            *counts.entry((entry.job_type(), entry.status)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((job_type, status), count)| StatusCount {
                job_type,
                status,
                count,
            })
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// The queue facade: validates routing, retries contended claims, records metrics.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    capabilities: Arc<CapabilityTable>,
    retry: RetryPolicy,
}

impl JobQueue {
    /// Create a new job queue with the given backend.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        capabilities: Arc<CapabilityTable>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            capabilities,
            retry,
        }
    }

    /// Create a new in-memory job queue with the built-in capability table.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryQueueBackend::new()),
            Arc::new(CapabilityTable::builtin()),
            RetryPolicy::default(),
        )
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTable> {
        &self.capabilities
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Enqueue a job unless one is already pending for the key.
    ///
    /// The job is skipped at claim time if its cached result is already up
    /// to date.
    pub async fn enqueue(
        &self,
        key: JobKey,
        parameters: serde_json::Value,
        priority: JobPriority,
        worker_size: WorkerSizeClass,
    ) -> Result<EnqueueOutcome> {
        self.insert(QueueEntry::waiting(key, parameters, priority, worker_size))
            .await
    }

    /// Enqueue a job that runs even if its cached result is up to date.
    pub async fn enqueue_forced(
        &self,
        key: JobKey,
        parameters: serde_json::Value,
        priority: JobPriority,
        worker_size: WorkerSizeClass,
    ) -> Result<EnqueueOutcome> {
        self.insert(QueueEntry::waiting(key, parameters, priority, worker_size).forced())
            .await
    }

    #[instrument(skip_all, fields(entity = %entry.key.entity_id, job_type = %entry.key.job_type))]
    async fn insert(&self, entry: QueueEntry) -> Result<EnqueueOutcome> {
        let job_type = entry.job_type();
        let (priority, worker_size, force) = (entry.priority, entry.worker_size, entry.force);
        self.capabilities.ensure_allowed(job_type, worker_size)?;

        let outcome = self.backend.insert_if_absent(entry).await?;
        if outcome.is_created() {
            QueueMetrics::record_enqueued(job_type, worker_size);
            debug!(job_id = %outcome.job_id(), %priority, %worker_size, force, "Job enqueued");
        }
        Ok(outcome)
    }

    /// Claim the next job for a worker, retrying contention transparently.
    pub async fn claim(&self, filter: &ClaimFilter) -> Result<Option<QueueEntry>> {
        if filter.job_types.is_empty() {
            return Ok(None);
        }

        let mut attempt = 0;
        loop {
            match self.backend.claim(filter, Utc::now()).await {
                Ok(claimed) => return Ok(claimed),
                Err(e) if e.code() == ErrorCode::ClaimConflict && attempt < self.retry.claim_retries => {
                    QueueMetrics::record_claim_conflict(filter.worker_size);
                    let delay = self.retry.claim_delay(attempt);
                    warn!(
                        worker_size = %filter.worker_size,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Claim contention, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn stamp_revision(&self, key: &JobKey, revision: Revision) -> Result<()> {
        self.backend.stamp_revision(key, revision).await
    }

    pub async fn get(&self, key: &JobKey) -> Result<Option<QueueEntry>> {
        self.backend.get(key).await
    }

    pub async fn requeue(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool> {
        self.backend.requeue(key, started_at).await
    }

    pub async fn complete(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool> {
        self.backend.complete(key, started_at).await
    }

    pub async fn expired_leases(&self, started_before: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        self.backend.expired_leases(started_before).await
    }

    pub async fn waiting_depths(&self) -> Result<Vec<QueueDepth>> {
        self.backend.waiting_depths().await
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        self.backend.status_counts().await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty().await
    }
}
