//! Queue depth signal for the autoscaler.
//!
//! The autoscaler scales each worker pool from
//! `dsq_queue_waiting_jobs{job_type, worker_size}`. Every pair the capability
//! table allows is published, including empty ones, so a pool can scale to
//! zero instead of holding on to a stale value.

use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::cache::ResultCache;
use crate::error::Result;
use crate::jobs::{JobQueue, JobStatus, JobType, QueueDepth, WorkerSizeClass};

/// Autoscaler signal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// How often gauges are refreshed
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// Projects queue and cache state onto gauges.
#[derive(Clone)]
pub struct QueueDepthEmitter {
    queue: JobQueue,
    cache: ResultCache,
}

impl QueueDepthEmitter {
    pub fn new(queue: JobQueue, cache: ResultCache) -> Self {
        Self { queue, cache }
    }

    /// Waiting count for every allowed `(job type, size)` pair, zeros included.
    ///
    /// Pairs present in the queue but no longer allowed (after a size
    /// override changed) are appended so their backlog stays visible.
    pub async fn snapshot(&self) -> Result<Vec<QueueDepth>> {
        let mut observed: HashMap<(JobType, WorkerSizeClass), u64> = self
            .queue
            .waiting_depths()
            .await?
            .into_iter()
            .map(|d| ((d.job_type, d.worker_size), d.waiting))
            .collect();

        let mut depths: Vec<QueueDepth> = self
            .queue
            .capabilities()
            .pairs()
            .into_iter()
            .map(|(job_type, worker_size)| QueueDepth {
                job_type,
                worker_size,
                waiting: observed.remove(&(job_type, worker_size)).unwrap_or(0),
            })
            .collect();

        let mut leftovers: Vec<QueueDepth> = observed
            .into_iter()
            .map(|((job_type, worker_size), waiting)| QueueDepth {
                job_type,
                worker_size,
                waiting,
            })
            .collect();
        leftovers.sort_by_key(|d| (d.job_type.as_str(), d.worker_size));
        depths.extend(leftovers);

        Ok(depths)
    }

    /// Refresh every gauge and return the depth snapshot.
    pub async fn publish(&self) -> Result<Vec<QueueDepth>> {
        let depths = self.snapshot().await?;
        for depth in &depths {
            gauge!(
                "dsq_queue_waiting_jobs",
                "job_type" => depth.job_type.as_str(),
                "worker_size" => depth.worker_size.as_str(),
            )
            .set(depth.waiting as f64);
        }

        let mut statuses: HashMap<(JobType, JobStatus), u64> = HashMap::new();
        for job_type in JobType::ALL {
            for status in [JobStatus::Waiting, JobStatus::Started] {
                statuses.insert((job_type, status), 0);
            }
        }
        for count in self.queue.status_counts().await? {
            statuses.insert((count.job_type, count.status), count.count);
        }
        for ((job_type, status), count) in statuses {
            gauge!(
                "dsq_queue_jobs",
                "job_type" => job_type.as_str(),
                "status" => status.as_str(),
            )
            .set(count as f64);
        }

        for count in self.cache.counts().await? {
            gauge!(
                "dsq_cache_entries",
                "job_type" => count.job_type.as_str(),
                "kind" => count.kind,
            )
            .set(count.count as f64);
        }

        debug!(pairs = depths.len(), "Queue depth gauges refreshed");
        Ok(depths)
    }
}
