//! Interval scheduling for maintenance tasks: lease reclaim, periodic
//! backfill and autoscaler gauge refresh.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use crate::backfill::{BackfillController, BackfillScope};
use crate::error::{ErrorCode, Result};
use crate::telemetry::autoscaler::QueueDepthEmitter;
use crate::telemetry::metrics::MaintenanceMetrics;

/// Interval-based schedule specification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntervalSchedule {
    /// Duration between executions
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Whether to run immediately on start
    #[serde(default)]
    pub run_immediately: bool,
}

impl IntervalSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            run_immediately: false,
        }
    }

    pub fn with_immediate(mut self) -> Self {
        self.run_immediately = true;
        self
    }
}

/// A periodic maintenance task.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in Tasks
// ═══════════════════════════════════════════════════════════════════════════════

/// Requeues or terminates Started jobs whose lease expired.
pub struct LeaseReclaimTask {
    dispatcher: Dispatcher,
}

impl LeaseReclaimTask {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MaintenanceTask for LeaseReclaimTask {
    fn name(&self) -> &'static str {
        "lease_reclaim"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        let report = self.dispatcher.reclaim_expired(Utc::now()).await?;
        if report.requeued + report.exhausted > 0 {
            tracing::info!(
                requeued = report.requeued,
                exhausted = report.exhausted,
                "Expired leases reclaimed"
            );
        }
        Ok(())
    }
}

/// Periodic backfill of retryable errors.
pub struct PeriodicBackfillTask {
    controller: Arc<BackfillController>,
}

impl PeriodicBackfillTask {
    pub fn new(controller: Arc<BackfillController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl MaintenanceTask for PeriodicBackfillTask {
    fn name(&self) -> &'static str {
        "backfill"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        match self.controller.run(BackfillScope::default(), cancel).await {
            Ok(_) => Ok(()),
            // An admin run is already going; the next tick will try again.
            Err(e) if e.code() == ErrorCode::BackfillInProgress => {
                tracing::debug!("Backfill already running, skipping tick");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Refreshes the queue depth gauges.
pub struct DepthPublishTask {
    emitter: QueueDepthEmitter,
}

impl DepthPublishTask {
    pub fn new(emitter: QueueDepthEmitter) -> Self {
        Self { emitter }
    }
}

#[async_trait]
impl MaintenanceTask for DepthPublishTask {
    fn name(&self) -> &'static str {
        "autoscaler_publish"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        self.emitter.publish().await.map(|_| ())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

struct ScheduledTask {
    task: Arc<dyn MaintenanceTask>,
    schedule: IntervalSchedule,
}

/// Runs maintenance tasks on fixed intervals until cancelled.
#[derive(Default)]
pub struct MaintenanceScheduler {
    tasks: Vec<ScheduledTask>,
}

impl MaintenanceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task.
    pub fn schedule(&mut self, task: Arc<dyn MaintenanceTask>, schedule: IntervalSchedule) {
        self.tasks.push(ScheduledTask { task, schedule });
    }

    /// Names of registered tasks.
    pub fn list(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.task.name()).collect()
    }

    /// Spawn one loop per task.
    pub fn start(self, shutdown: CancellationToken) -> SchedulerHandle {
        let handles = self
            .tasks
            .into_iter()
            .map(|scheduled| tokio::spawn(run_task(scheduled, shutdown.clone())))
            .collect();

        SchedulerHandle { shutdown, handles }
    }
}

async fn run_task(scheduled: ScheduledTask, shutdown: CancellationToken) {
    let name = scheduled.task.name();
    let mut ticker = tokio::time::interval(scheduled.schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !scheduled.schedule.run_immediately {
        ticker.tick().await;
    }

    tracing::info!(
        task = name,
        interval_secs = scheduled.schedule.interval.as_secs(),
        "Maintenance task scheduled"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let result = scheduled.task.run(&shutdown).await;
        MaintenanceMetrics::record_run(name, result.is_ok(), started.elapsed());
        if let Err(e) = result {
            tracing::error!(task = name, error = %e, "Maintenance task failed");
        }
    }

    tracing::info!(task = name, "Maintenance task stopped");
}

/// Handle over the running task loops.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Cancel every loop and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Maintenance task panicked");
            }
        }
    }
}
