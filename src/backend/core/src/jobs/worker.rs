//! In-process job worker: claims jobs for one size class, runs them through a
//! [`JobRunner`] under a compute timeout, and reports the outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{Dispatcher, ReportDisposition};
use super::job::{JobError, JobOutcome, JobType, QueueEntry, WorkerSizeClass, TIMEOUT_ERROR_CODE};

/// The computation behind a job type. Opaque to the queue.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &QueueEntry) -> std::result::Result<serde_json::Value, JobError>;
}

/// Configuration for the job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name/identifier
    #[serde(default = "default_worker_name")]
    pub name: String,
    /// Size class this worker is provisioned for
    #[serde(default = "default_worker_size")]
    pub size: WorkerSizeClass,
    /// Job types to accept; empty means every type allowed for the size
    #[serde(default)]
    pub job_types: Vec<JobType>,
    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Wait between claims when the queue is empty
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Per-job compute limit; expiry is reported as a transient error
    #[serde(default = "default_compute_timeout", with = "humantime_serde")]
    pub compute_timeout: Duration,
    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_worker_name() -> String { "dsq-worker".to_string() }
fn default_worker_size() -> WorkerSizeClass { WorkerSizeClass::Light }
fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_compute_timeout() -> Duration { Duration::from_secs(20 * 60) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            size: default_worker_size(),
            job_types: Vec::new(),
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            compute_timeout: default_compute_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs processed
    pub processed: Arc<AtomicU64>,
    /// Total jobs succeeded
    pub succeeded: Arc<AtomicU64>,
    /// Total jobs failed (any error outcome)
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop claiming and wait for in-flight jobs.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Job worker that processes jobs from the dispatcher.
pub struct JobWorker {
    config: WorkerConfig,
    dispatcher: Dispatcher,
    runner: Arc<dyn JobRunner>,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(config: WorkerConfig, dispatcher: Dispatcher, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            config,
            dispatcher,
            runner,
            stats: WorkerStats::new(),
        }
    }

    /// Job types this worker claims.
    pub fn accepted_job_types(&self) -> Vec<JobType> {
        let capabilities = self.dispatcher.queue().capabilities();
        if self.config.job_types.is_empty() {
            capabilities.job_types_for(self.config.size)
        } else {
            self.config
                .job_types
                .iter()
                .copied()
                .filter(|t| capabilities.allows(*t, self.config.size))
                .collect()
        }
    }

    /// Start the worker, returning a handle for control.
    pub fn start(self, shutdown: CancellationToken) -> WorkerHandle {
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(self.run_loop(token));

        WorkerHandle {
            shutdown,
            stats,
            task,
        }
    }

    async fn run_loop(self, shutdown: CancellationToken) {
        let config = self.config.clone();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let job_types = self.accepted_job_types();

        tracing::info!(
            worker = %config.name,
            worker_size = %config.size,
            concurrency = config.concurrency,
            job_types = ?job_types,
            "Job worker started"
        );

        let worker = Arc::new(self);
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // A claim in flight when shutdown fires completes, and its job runs.
            let claimed = worker.dispatcher.claim_next(config.size, &job_types).await;

            match claimed {
                Ok(Some(job)) => {
                    let worker = worker.clone();
                    tokio::spawn(async move {
                        worker.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(worker = %config.name, error = %e, "Claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(worker = %config.name, "Worker shutting down, draining in-flight jobs");
        let permits = config.concurrency.max(1) as u32;
        match tokio::time::timeout(config.shutdown_timeout, semaphore.acquire_many(permits)).await {
            Ok(_) => tracing::info!(worker = %config.name, "Worker stopped"),
            Err(_) => tracing::warn!(
                worker = %config.name,
                active = worker.stats.active(),
                "Worker stopped with jobs still running; their leases will expire"
            ),
        };
    }

    async fn execute(&self, job: QueueEntry) {
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.config.compute_timeout, self.runner.run(&job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::transient(
                TIMEOUT_ERROR_CODE,
                format!(
                    "Job exceeded the maximum duration of {}s",
                    self.config.compute_timeout.as_secs()
                ),
            )),
        };
        metrics::histogram!("dsq_job_compute_seconds", "job_type" => job.job_type().as_str())
            .record(started.elapsed().as_secs_f64());

        let succeeded = result.is_ok();
        let Some(claim) = job.claim_token() else {
            tracing::error!(entity = %job.key.entity_id, "Claimed job has no claim token");
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
            return;
        };
        match self.dispatcher.report_outcome(&claim, JobOutcome::from(result)).await {
            Ok(disposition) => {
                tracing::debug!(
                    entity = %job.key.entity_id,
                    job_type = %job.job_type(),
                    attempt = job.attempt_count,
                    disposition = disposition.as_str(),
                    "Job finished"
                );
                if disposition == ReportDisposition::Completed {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::error!(
                    entity = %job.key.entity_id,
                    job_type = %job.job_type(),
                    succeeded,
                    error = %e,
                    "Failed to report job outcome"
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.size, WorkerSizeClass::Light);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.succeeded(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.active(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }
}
