//! Job queue and dispatch.
//!
//! - **Jobs**: closed set of job types, keys fingerprinted from parameters,
//!   and the outcome taxonomy workers report
//! - **Capabilities**: which worker size classes may run each job type, and
//!   which job types a success triggers
//! - **Queue**: at most one pending entry per key, claimed atomically
//! - **Dispatcher**: claim, outcome reporting and lease reclaim
//! - **Worker**: in-process worker driving a [`JobRunner`]
//! - **Scheduler**: interval loops for maintenance tasks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   enqueue    │───▶│    Queue     │───▶│  Dispatcher  │───▶│    Worker    │
//! │ (API/backfill)│   │ (Waiting/    │    │ (claim/report│    │ (JobRunner)  │
//! └──────────────┘    │  Started)    │    │  /reclaim)   │    └──────────────┘
//!                     └──────────────┘    └──────┬───────┘
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │ Results cache│
//!                                         └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use dsq_core::jobs::{Dispatcher, JobKey, JobOutcome, JobPriority, JobType, WorkerSizeClass};
//!
//! let key = JobKey::new("user/dataset", JobType::Splits, &params);
//! queue.enqueue(key.clone(), params, JobPriority::NORMAL, WorkerSizeClass::Light).await?;
//!
//! if let Some(job) = dispatcher.claim_next(WorkerSizeClass::Light, &[JobType::Splits]).await? {
//!     let claim = job.claim_token().expect("claimed entries are Started");
//!     dispatcher.report_outcome(&claim, JobOutcome::success(payload)).await?;
//! }
//! ```

pub mod capability;
pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use capability::{CapabilityTable, JobSpec};
pub use dispatcher::{Dispatcher, ReclaimReport, ReportDisposition};
pub use job::{
    canonical_json, parameters_fingerprint, ClaimToken, JobError, JobErrorKind, JobId, JobKey,
    JobOutcome, JobPriority, JobStatus, JobType, QueueEntry, RetryPolicy, Revision,
    WorkerSizeClass, CONNECTION_ERROR_CODE, CRASHED_ERROR_CODE, TIMEOUT_ERROR_CODE,
};
pub use queue::{
    ClaimFilter, EnqueueOutcome, InMemoryQueueBackend, JobQueue, QueueBackend, QueueDepth,
    StatusCount,
};
pub use scheduler::{
    DepthPublishTask, IntervalSchedule, LeaseReclaimTask, MaintenanceScheduler, MaintenanceTask,
    PeriodicBackfillTask, SchedulerHandle,
};
pub use worker::{JobRunner, JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
