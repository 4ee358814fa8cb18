//! Prometheus metrics for the queue, the cache and the backfill controller.
//!
//! # Example
//!
//! ```rust,no_run
//! use dsq_core::telemetry::metrics::QueueMetrics;
//! use dsq_core::jobs::{JobType, WorkerSizeClass};
//!
//! QueueMetrics::record_enqueued(JobType::Splits, WorkerSizeClass::Light);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::jobs::{JobType, WorkerSizeClass};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every series, e.g. the deployment region
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0, 300.0,
    ]
}

/// Handle over the installed Prometheus recorder.
#[derive(Clone)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry without a recorder; `render` returns an empty exposition.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Errors
    describe_counter!("dsq_errors_total", "Total number of service errors by code");

    // Queue
    describe_counter!("dsq_jobs_enqueued_total", "Jobs created in the queue");
    describe_counter!("dsq_jobs_claimed_total", "Jobs handed to a worker");
    describe_counter!(
        "dsq_jobs_finished_total",
        "Reported outcomes by job type and disposition"
    );
    describe_counter!("dsq_claim_conflicts_total", "Claim attempts lost to contention");
    describe_counter!("dsq_leases_reclaimed_total", "Started jobs reclaimed after lease expiry");
    describe_histogram!(
        "dsq_job_wait_seconds",
        "Time between enqueue and claim in seconds"
    );

    // Autoscaler signal
    describe_gauge!(
        "dsq_queue_waiting_jobs",
        "Waiting jobs per job type and worker size class"
    );
    describe_gauge!("dsq_queue_jobs", "Queue entries per job type and status");
    describe_gauge!("dsq_cache_entries", "Cache entries per job type and outcome kind");

    // Backfill
    describe_counter!("dsq_backfill_runs_total", "Backfill runs by outcome");
    describe_counter!("dsq_backfill_enqueued_total", "Jobs created by backfill runs");
    describe_histogram!("dsq_backfill_duration_seconds", "Backfill run duration in seconds");

    // Worker
    describe_histogram!(
        "dsq_job_compute_seconds",
        "Time spent by the runner computing a job"
    );

    // Scheduler
    describe_histogram!(
        "dsq_maintenance_task_seconds",
        "Duration of maintenance task runs"
    );
}

/// Counters for queue transitions.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued(job_type: JobType, size: WorkerSizeClass) {
        counter!(
            "dsq_jobs_enqueued_total",
            "job_type" => job_type.as_str(),
            "worker_size" => size.as_str(),
        )
        .increment(1);
    }

    pub fn record_claimed(job_type: JobType, size: WorkerSizeClass, waited: Duration) {
        counter!(
            "dsq_jobs_claimed_total",
            "job_type" => job_type.as_str(),
            "worker_size" => size.as_str(),
        )
        .increment(1);
        histogram!("dsq_job_wait_seconds", "job_type" => job_type.as_str())
            .record(waited.as_secs_f64());
    }

    pub fn record_finished(job_type: JobType, disposition: &'static str) {
        counter!(
            "dsq_jobs_finished_total",
            "job_type" => job_type.as_str(),
            "disposition" => disposition,
        )
        .increment(1);
    }

    pub fn record_claim_conflict(size: WorkerSizeClass) {
        counter!("dsq_claim_conflicts_total", "worker_size" => size.as_str()).increment(1);
    }

    pub fn record_lease_reclaimed(job_type: JobType, exhausted: bool) {
        counter!(
            "dsq_leases_reclaimed_total",
            "job_type" => job_type.as_str(),
            "exhausted" => exhausted.to_string(),
        )
        .increment(1);
    }
}

/// Counters for backfill runs.
pub struct BackfillMetrics;

impl BackfillMetrics {
    pub fn record_run(outcome: &'static str, enqueued: u64, duration: Duration) {
        counter!("dsq_backfill_runs_total", "outcome" => outcome).increment(1);
        counter!("dsq_backfill_enqueued_total").increment(enqueued);
        histogram!("dsq_backfill_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Maintenance loop timings.
pub struct MaintenanceMetrics;

impl MaintenanceMetrics {
    pub fn record_run(task: &'static str, succeeded: bool, duration: Duration) {
        histogram!(
            "dsq_maintenance_task_seconds",
            "task" => task,
            "result" => if succeeded { "ok" } else { "error" },
        )
        .record(duration.as_secs_f64());
    }
}
