//! Backfill controller.
//!
//! Re-enqueues work the cache says is worth recomputing. The periodic run
//! only picks up retryable error entries; admin runs can widen the scope to
//! stale entries and to children that were never computed.
//!
//! A run walks the cache in [`JobKey`] order, page by page, and remembers
//! the last key it handled per scope. A cancelled run resumes from there;
//! a completed run clears the checkpoint. Enqueues go through the queue's
//! unicity, so running twice never duplicates a pending job.

pub mod lock;

pub use lock::{InProcessLock, LeaderLock, LockToken, RedisLeaderLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheEntry, CacheFilter, ResultCache};
use crate::error::{DsqError, Result};
use crate::jobs::{JobKey, JobPriority, JobQueue, JobType};
use crate::telemetry::metrics::BackfillMetrics;

const LOCK_NAME: &str = "backfill";

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for backfill runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Run the periodic backfill on the scheduler
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay between periodic runs
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Priority of enqueued jobs; must stay below interactive traffic
    #[serde(default = "default_priority")]
    pub priority: JobPriority,
    /// Cache entries fetched per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Leader lock lifetime
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub lock_ttl: Duration,
}

fn default_enabled() -> bool { true }
fn default_interval() -> Duration { Duration::from_secs(60 * 60) }
fn default_priority() -> JobPriority { JobPriority::LOW }
fn default_page_size() -> usize { 500 }
fn default_lock_ttl() -> Duration { Duration::from_secs(10 * 60) }

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_interval(),
            priority: default_priority(),
            page_size: default_page_size(),
            lock_ttl: default_lock_ttl(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope, State and Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Which cache entries a run considers.
///
/// The default scope selects retryable errors only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackfillScope {
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Also re-enqueue entries invalidated by a revision bump or runner upgrade.
    #[serde(default)]
    pub include_stale: bool,
    /// Also enqueue children of successful entries that have no cache entry.
    #[serde(default)]
    pub include_missing: bool,
}

impl BackfillScope {
    fn cache_filter(&self) -> CacheFilter {
        CacheFilter {
            job_type: self.job_type,
            entity_id: self.entity_id.clone(),
            error_code: self.error_code.clone(),
            retryable_only: !(self.include_stale || self.include_missing),
        }
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    Idle,
    Scanning,
    Enqueuing,
}

impl BackfillState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scanning,
            2 => Self::Enqueuing,
            _ => Self::Idle,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Enqueuing => "enqueuing",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillOutcome {
    /// Every page was scanned; the checkpoint was cleared.
    Completed,
    /// Cancelled; the checkpoint was kept.
    Interrupted,
    /// Another process holds the leader lock.
    Skipped,
}

impl BackfillOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Skipped => "skipped",
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub outcome: BackfillOutcome,
    /// Cache entries examined
    pub scanned: u64,
    /// Jobs newly created
    pub enqueued: u64,
    /// Eligible keys that already had a pending job
    pub already_pending: u64,
    /// Last key handled, kept when interrupted
    pub checkpoint: Option<JobKey>,
    pub duration_ms: u64,
}

impl BackfillReport {
    fn new(outcome: BackfillOutcome) -> Self {
        Self {
            outcome,
            scanned: 0,
            enqueued: 0,
            already_pending: 0,
            checkpoint: None,
            duration_ms: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════════════

/// Scans the cache and re-enqueues eligible jobs.
pub struct BackfillController {
    queue: JobQueue,
    cache: ResultCache,
    lock: Arc<dyn LeaderLock>,
    config: BackfillConfig,
    state: AtomicU8,
    running: Mutex<()>,
    checkpoints: DashMap<BackfillScope, JobKey>,
}

impl BackfillController {
    pub fn new(
        queue: JobQueue,
        cache: ResultCache,
        lock: Arc<dyn LeaderLock>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            queue,
            cache,
            lock,
            config,
            state: AtomicU8::new(BackfillState::Idle as u8),
            running: Mutex::new(()),
            checkpoints: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn state(&self) -> BackfillState {
        BackfillState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Last key handled by an interrupted run of this scope.
    pub fn checkpoint(&self, scope: &BackfillScope) -> Option<JobKey> {
        self.checkpoints.get(scope).map(|entry| entry.value().clone())
    }

    fn set_state(&self, state: BackfillState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run a backfill over `scope` until done or `cancel` fires.
    ///
    /// Fails with `BackfillInProgress` if this process is already running
    /// one. Reports `Skipped` if another process holds the leader lock.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, scope: BackfillScope, cancel: &CancellationToken) -> Result<BackfillReport> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| DsqError::backfill_in_progress())?;
        let started = Instant::now();

        let Some(token) = self.lock.try_acquire(LOCK_NAME, self.config.lock_ttl).await? else {
            info!("Backfill leader lock held elsewhere, skipping run");
            let report = BackfillReport::new(BackfillOutcome::Skipped);
            BackfillMetrics::record_run(report.outcome.as_str(), 0, started.elapsed());
            return Ok(report);
        };

        let result = self.scan(&scope, cancel).await;
        self.set_state(BackfillState::Idle);

        if let Err(e) = self.lock.release(LOCK_NAME, &token).await {
            warn!(error = %e, "Failed to release backfill leader lock");
        }

        match result {
            Ok(mut report) => {
                let duration = started.elapsed();
                report.duration_ms = duration.as_millis() as u64;
                BackfillMetrics::record_run(report.outcome.as_str(), report.enqueued, duration);
                info!(
                    outcome = report.outcome.as_str(),
                    scanned = report.scanned,
                    enqueued = report.enqueued,
                    already_pending = report.already_pending,
                    duration_ms = report.duration_ms,
                    "Backfill run finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Backfill run failed");
                BackfillMetrics::record_run("failed", 0, started.elapsed());
                Err(e)
            }
        }
    }

    async fn scan(&self, scope: &BackfillScope, cancel: &CancellationToken) -> Result<BackfillReport> {
        let filter = scope.cache_filter();
        let page_size = self.config.page_size.max(1);
        let mut after = self.checkpoint(scope);
        let mut report = BackfillReport::new(BackfillOutcome::Completed);

        if let Some(key) = &after {
            info!(checkpoint = %key, "Resuming backfill from checkpoint");
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(self.interrupted(report, after));
            }

            self.set_state(BackfillState::Scanning);
            let page = self.cache.scan(&filter, after.as_ref(), page_size).await?;
            let last_page = page.len() < page_size;

            self.set_state(BackfillState::Enqueuing);
            for entry in page {
                if cancel.is_cancelled() {
                    return Ok(self.interrupted(report, after));
                }

                report.scanned += 1;
                for (key, parameters) in self.eligible(scope, &entry).await? {
                    let size = self.queue.capabilities().default_size(key.job_type);
                    let outcome = self
                        .queue
                        .enqueue(key, parameters, self.config.priority, size)
                        .await?;
                    if outcome.is_created() {
                        report.enqueued += 1;
                    } else {
                        report.already_pending += 1;
                    }
                }

                self.checkpoints.insert(scope.clone(), entry.key.clone());
                after = Some(entry.key);
            }

            if last_page {
                self.checkpoints.remove(scope);
                return Ok(report);
            }
            debug!(scanned = report.scanned, "Backfill page done");
        }
    }

    fn interrupted(&self, mut report: BackfillReport, checkpoint: Option<JobKey>) -> BackfillReport {
        info!(scanned = report.scanned, "Backfill interrupted, checkpoint kept");
        report.outcome = BackfillOutcome::Interrupted;
        report.checkpoint = checkpoint;
        report
    }

    async fn eligible(
        &self,
        scope: &BackfillScope,
        entry: &CacheEntry,
    ) -> Result<Vec<(JobKey, serde_json::Value)>> {
        let mut keys = Vec::new();

        let stale = scope.include_stale && !self.cache.freshness(entry).await?.is_fresh();
        if entry.outcome.is_retryable_error() || stale {
            keys.push((entry.key.clone(), entry.parameters.clone()));
        }

        if scope.include_missing && entry.outcome.is_success() {
            for child in self.queue.capabilities().children(entry.job_type()) {
                let key = JobKey::from_parts(&entry.key.entity_id, child, &entry.key.fingerprint);
                if self.cache.backend().get(&key).await?.is_none() {
                    keys.push((key, entry.parameters.clone()));
                }
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOutcome;
    use crate::jobs::{CapabilityTable, JobError, CONNECTION_ERROR_CODE};
    use chrono::Utc;
    use serde_json::json;

    fn controller(queue: &JobQueue, cache: &ResultCache) -> BackfillController {
        BackfillController::new(
            queue.clone(),
            cache.clone(),
            Arc::new(InProcessLock::new()),
            BackfillConfig {
                page_size: 2,
                ..Default::default()
            },
        )
    }

    async fn put_error(cache: &ResultCache, entity: &str, job_type: JobType, error: JobError) {
        let key = JobKey::new(entity, job_type, &json!({}));
        let runner = CapabilityTable::builtin().runner_version(job_type);
        cache
            .put(key, json!({}), CacheOutcome::error(error, Utc::now()), 0, runner, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_default_scope_enqueues_retryable_only() {
        let queue = JobQueue::in_memory();
        let cache = ResultCache::in_memory();
        put_error(&cache, "a", JobType::Splits, JobError::transient(CONNECTION_ERROR_CODE, "reset")).await;
        put_error(&cache, "b", JobType::Splits, JobError::permanent("BadFormat", "nope")).await;
        put_error(&cache, "c", JobType::Info, JobError::transient(CONNECTION_ERROR_CODE, "reset")).await;

        let backfill = controller(&queue, &cache);
        let report = backfill
            .run(BackfillScope::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, BackfillOutcome::Completed);
        assert_eq!(report.enqueued, 2);
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(backfill.state(), BackfillState::Idle);

        let pending = queue
            .get(&JobKey::new("a", JobType::Splits, &json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.priority, JobPriority::LOW);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let queue = JobQueue::in_memory();
        let cache = ResultCache::in_memory();
        put_error(&cache, "a", JobType::Splits, JobError::transient(CONNECTION_ERROR_CODE, "reset")).await;

        let backfill = controller(&queue, &cache);
        let token = CancellationToken::new();
        backfill.run(BackfillScope::default(), &token).await.unwrap();
        let second = backfill.run(BackfillScope::default(), &token).await.unwrap();

        assert_eq!(second.enqueued, 0);
        assert_eq!(second.already_pending, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_checkpoint() {
        let queue = JobQueue::in_memory();
        let cache = ResultCache::in_memory();
        put_error(&cache, "a", JobType::Splits, JobError::transient(CONNECTION_ERROR_CODE, "reset")).await;

        let backfill = controller(&queue, &cache);
        let token = CancellationToken::new();
        token.cancel();
        let report = backfill.run(BackfillScope::default(), &token).await.unwrap();

        assert_eq!(report.outcome, BackfillOutcome::Interrupted);
        assert_eq!(report.scanned, 0);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_skipped_when_lock_held() {
        let queue = JobQueue::in_memory();
        let cache = ResultCache::in_memory();
        let lock = Arc::new(InProcessLock::new());
        lock.try_acquire(LOCK_NAME, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let backfill = BackfillController::new(queue, cache, lock, BackfillConfig::default());
        let report = backfill
            .run(BackfillScope::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, BackfillOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_include_missing_enqueues_children() {
        let queue = JobQueue::in_memory();
        let cache = ResultCache::in_memory();
        let key = JobKey::new("ds", JobType::Splits, &json!({}));
        let runner = CapabilityTable::builtin().runner_version(JobType::Splits);
        cache
            .put(key, json!({}), CacheOutcome::success(json!({}), Utc::now()), 0, runner, 1)
            .await
            .unwrap();

        let backfill = controller(&queue, &cache);
        let scope = BackfillScope {
            include_missing: true,
            ..Default::default()
        };
        let report = backfill.run(scope, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.enqueued, 1);
        let child = queue
            .get(&JobKey::new("ds", JobType::FirstRows, &json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.worker_size, CapabilityTable::builtin().default_size(JobType::FirstRows));
    }
}
