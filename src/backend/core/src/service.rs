//! Job service: the entry points shared by the HTTP API and the server binary.
//!
//! A [`JobService`] wires one queue, one cache, the dispatcher, the backfill
//! controller and the depth emitter over a single set of backends, and can
//! start an embedded [`JobWorker`] for a caller-supplied runner. Backends
//! are chosen by [`ServiceBackends::from_config`]: Postgres and Redis when
//! their URLs are configured, in-memory stores and a process-local lock
//! otherwise.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backfill::{
    BackfillController, BackfillReport, BackfillScope, BackfillState, InProcessLock, LeaderLock,
    RedisLeaderLock,
};
use crate::cache::{CacheBackend, CacheCount, GetOrSchedule, InMemoryCacheBackend, ResultCache};
use crate::config::Config;
use crate::db::{Database, DatabaseHealth, PgCacheBackend, PgMigrationStore, PgQueueBackend};
use crate::error::{DsqError, Result};
use crate::jobs::{
    ClaimToken, Dispatcher, EnqueueOutcome, InMemoryQueueBackend, JobKey, JobOutcome,
    JobPriority, JobQueue, JobRunner, JobType, JobWorker, QueueBackend, QueueDepth, QueueEntry,
    ReportDisposition, Revision, StatusCount, WorkerConfig, WorkerHandle, WorkerSizeClass,
};
use crate::migrations::{self, MigrationRunner};
use crate::telemetry::QueueDepthEmitter;

// ═══════════════════════════════════════════════════════════════════════════════
// Backends
// ═══════════════════════════════════════════════════════════════════════════════

/// Store handles a service runs on.
#[derive(Clone)]
pub struct ServiceBackends {
    pub queue: Arc<dyn QueueBackend>,
    pub cache: Arc<dyn CacheBackend>,
    pub lock: Arc<dyn LeaderLock>,
    /// Present when the stores are Postgres; used for health reporting.
    pub database: Option<Database>,
}

impl ServiceBackends {
    /// In-memory stores with a process-local lock.
    pub fn in_memory() -> Self {
        Self {
            queue: Arc::new(InMemoryQueueBackend::new()),
            cache: Arc::new(InMemoryCacheBackend::new()),
            lock: Arc::new(InProcessLock::new()),
            database: None,
        }
    }

    /// Connect the configured stores, applying pending migrations first.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut backends = Self::in_memory();

        if config.database.url.is_some() {
            let database = Database::connect(&config.database).await?;
            let runner = MigrationRunner::new(PgMigrationStore::new(database.pool().clone()));
            let report = runner.apply_all(&migrations::builtin()).await?;
            info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                "Schema up to date"
            );

            backends.queue = Arc::new(PgQueueBackend::new(database.pool().clone()));
            backends.cache = Arc::new(PgCacheBackend::new(database.pool().clone()));
            backends.database = Some(database);
        } else {
            warn!("database.url not set, queue and cache are in-memory");
        }

        if let Some(url) = config.redis.url.as_deref() {
            let client = redis::Client::open(url)?;
            backends.lock = Arc::new(RedisLeaderLock::new(client, config.redis.lock_prefix.clone()));
        }

        Ok(backends)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub key: JobKey,
    pub worker_size: WorkerSizeClass,
    pub priority: JobPriority,
    pub enqueue: EnqueueOutcome,
}

/// Queue and cache totals reported alongside the depth snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthReport {
    pub waiting: Vec<QueueDepth>,
    pub statuses: Vec<StatusCount>,
    pub cache: Vec<CacheCount>,
}

/// Service health.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub backfill: BackfillState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Submission, dispatch, cache reads, invalidation and admin backfill.
#[derive(Clone)]
pub struct JobService {
    queue: JobQueue,
    cache: ResultCache,
    dispatcher: Dispatcher,
    backfill: Arc<BackfillController>,
    emitter: QueueDepthEmitter,
    database: Option<Database>,
    default_priority: JobPriority,
    miss_priority: JobPriority,
    worker: WorkerConfig,
    shutdown: CancellationToken,
}

impl JobService {
    /// Build a service over the given backends.
    pub fn new(config: &Config, backends: ServiceBackends) -> Result<Self> {
        let capabilities = Arc::new(config.capability_table()?);
        let queue = JobQueue::new(
            backends.queue,
            capabilities.clone(),
            config.queue.retry_policy(),
        );
        let cache = ResultCache::new(backends.cache, capabilities);
        let dispatcher = Dispatcher::new(queue.clone(), cache.clone(), config.queue.lease_timeout);
        let backfill = Arc::new(BackfillController::new(
            queue.clone(),
            cache.clone(),
            backends.lock,
            config.backfill.clone(),
        ));
        let emitter = QueueDepthEmitter::new(queue.clone(), cache.clone());

        Ok(Self {
            queue,
            cache,
            dispatcher,
            backfill,
            emitter,
            database: backends.database,
            default_priority: config.queue.default_priority,
            miss_priority: config.cache.miss_priority,
            worker: config.worker.clone(),
            shutdown: CancellationToken::new(),
        })
    }

    /// A service over in-memory stores.
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::new(config, ServiceBackends::in_memory())
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn backfill_controller(&self) -> &Arc<BackfillController> {
        &self.backfill
    }

    pub fn depth_emitter(&self) -> &QueueDepthEmitter {
        &self.emitter
    }

    /// Token cancelled on shutdown; admin backfills observe it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Enqueue a job at the default size of its type.
    ///
    /// Unless `force` is set, the job is skipped at claim time when its
    /// cached result is already up to date.
    #[instrument(skip(self, parameters), fields(entity = %entity_id, job_type = %job_type))]
    pub async fn submit_job(
        &self,
        entity_id: &str,
        job_type: JobType,
        parameters: serde_json::Value,
        priority: Option<JobPriority>,
        force: bool,
    ) -> Result<SubmitResult> {
        let entity_id = validate_entity(entity_id)?;
        let parameters = normalize_parameters(parameters)?;
        let worker_size = self.queue.capabilities().default_size(job_type);
        let priority = priority.unwrap_or(self.default_priority);

        let key = JobKey::new(entity_id, job_type, &parameters);
        let enqueue = if force {
            self.queue
                .enqueue_forced(key.clone(), parameters, priority, worker_size)
                .await?
        } else {
            self.queue
                .enqueue(key.clone(), parameters, priority, worker_size)
                .await?
        };

        Ok(SubmitResult {
            key,
            worker_size,
            priority,
            enqueue,
        })
    }

    /// Claim the next job for a worker.
    ///
    /// `None` for `job_types` accepts every type the size class may run.
    pub async fn pull(
        &self,
        worker_size: WorkerSizeClass,
        job_types: Option<Vec<JobType>>,
    ) -> Result<Option<QueueEntry>> {
        let job_types =
            job_types.unwrap_or_else(|| self.queue.capabilities().job_types_for(worker_size));
        self.dispatcher.claim_next(worker_size, &job_types).await
    }

    /// Apply a worker's outcome to the claim it was issued for.
    pub async fn report(&self, claim: &ClaimToken, outcome: JobOutcome) -> Result<ReportDisposition> {
        self.dispatcher.report_outcome(claim, outcome).await
    }

    /// Start an in-process worker from the `[worker]` config section.
    ///
    /// The worker stops when the returned handle is shut down or the service
    /// shuts down.
    pub fn start_worker(&self, runner: Arc<dyn JobRunner>) -> WorkerHandle {
        JobWorker::new(self.worker.clone(), self.dispatcher.clone(), runner)
            .start(self.shutdown.child_token())
    }

    /// Serve the cached result, scheduling a computation when it is missing or stale.
    #[instrument(skip(self, parameters), fields(entity = %entity_id, job_type = %job_type))]
    pub async fn get_or_schedule(
        &self,
        entity_id: &str,
        job_type: JobType,
        parameters: serde_json::Value,
    ) -> Result<GetOrSchedule> {
        let entity_id = validate_entity(entity_id)?;
        let parameters = normalize_parameters(parameters)?;
        let worker_size = self.queue.capabilities().default_size(job_type);
        let key = JobKey::new(entity_id, job_type, &parameters);

        self.cache
            .get_or_schedule(&self.queue, key, parameters, worker_size, self.miss_priority)
            .await
    }

    /// Mark every cached result of an entity stale.
    pub async fn invalidate(&self, entity_id: &str) -> Result<Revision> {
        let entity_id = validate_entity(entity_id)?;
        self.cache.invalidate(entity_id).await
    }

    /// Run an admin backfill, interrupted only by service shutdown.
    pub async fn backfill(&self, scope: BackfillScope) -> Result<BackfillReport> {
        self.backfill.run(scope, &self.shutdown).await
    }

    /// Waiting counts per allowed pair, plus status and cache totals.
    pub async fn depth(&self) -> Result<DepthReport> {
        Ok(DepthReport {
            waiting: self.emitter.snapshot().await?,
            statuses: self.queue.status_counts().await?,
            cache: self.cache.counts().await?,
        })
    }

    pub async fn health(&self) -> ServiceHealth {
        let database = match &self.database {
            Some(db) => Some(db.health().await),
            None => None,
        };
        ServiceHealth {
            healthy: database.as_ref().map_or(true, |d| d.connected),
            backfill: self.backfill.state(),
            database,
        }
    }

    /// Cancel running admin backfills and embedded workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn validate_entity(entity_id: &str) -> Result<&str> {
    let trimmed = entity_id.trim();
    if trimmed.is_empty() {
        return Err(DsqError::validation("Entity id cannot be empty"));
    }
    Ok(trimmed)
}

/// Parameters must be a JSON object; `null` stands for no parameters.
fn normalize_parameters(parameters: serde_json::Value) -> Result<serde_json::Value> {
    match parameters {
        serde_json::Value::Null => Ok(serde_json::json!({})),
        serde_json::Value::Object(_) => Ok(parameters),
        other => Err(DsqError::validation(format!(
            "Job parameters must be a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> JobService {
        JobService::in_memory(&Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_uses_default_size_and_priority() {
        let service = service();
        let result = service
            .submit_job("squad", JobType::Splits, json!({"config": "plain_text"}), None, false)
            .await
            .unwrap();

        assert!(result.enqueue.is_created());
        assert_eq!(
            result.worker_size,
            service.queue().capabilities().default_size(JobType::Splits)
        );
        assert_eq!(result.priority, JobPriority::NORMAL);
    }

    #[tokio::test]
    async fn test_null_parameters_match_empty_object() {
        let service = service();
        let first = service
            .submit_job("squad", JobType::ConfigNames, serde_json::Value::Null, None, false)
            .await
            .unwrap();
        let second = service
            .submit_job("squad", JobType::ConfigNames, json!({}), None, false)
            .await
            .unwrap();

        assert_eq!(first.key, second.key);
        assert!(!second.enqueue.is_created());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let service = service();
        assert!(service
            .submit_job("  ", JobType::Splits, json!({}), None, false)
            .await
            .is_err());
        assert!(service
            .submit_job("squad", JobType::Splits, json!([1, 2]), None, false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pull_defaults_to_allowed_types() {
        let service = service();
        let submitted = service
            .submit_job("squad", JobType::ConfigNames, json!({}), None, false)
            .await
            .unwrap();

        let claimed = service
            .pull(submitted.worker_size, None)
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(claimed.key, submitted.key);

        let none = service.pull(submitted.worker_size, Some(Vec::new())).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_health_without_database() {
        let health = service().health().await;
        assert!(health.healthy);
        assert!(health.database.is_none());
        assert_eq!(health.backfill, BackfillState::Idle);
    }

    #[tokio::test]
    async fn test_forced_submit_reruns_up_to_date_job() {
        let service = service();
        let submitted = service
            .submit_job("squad", JobType::ConfigNames, json!({}), None, false)
            .await
            .unwrap();
        let claimed = service.pull(submitted.worker_size, None).await.unwrap().unwrap();
        service
            .report(&claimed.claim_token().unwrap(), JobOutcome::success(json!({})))
            .await
            .unwrap();
        let only = Some(vec![JobType::ConfigNames]);

        service
            .submit_job("squad", JobType::ConfigNames, json!({}), None, false)
            .await
            .unwrap();
        assert!(service.pull(submitted.worker_size, only.clone()).await.unwrap().is_none());

        let forced = service
            .submit_job("squad", JobType::ConfigNames, json!({}), None, true)
            .await
            .unwrap();
        assert!(forced.enqueue.is_created());
        let rerun = service.pull(submitted.worker_size, only).await.unwrap().unwrap();
        assert!(rerun.force);
    }
}
