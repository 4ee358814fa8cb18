#![allow(clippy::result_large_err)]
//! # dsq Core
//!
//! Job queue and results cache for the dataset processing pipeline.
//!
//! ## Architecture
//!
//! - **Jobs**: deduplicated queue, dispatcher with leases and bounded retries,
//!   size-class routing from a validated capability table
//! - **Cache**: last outcome per job key, stale after an entity revision bump
//!   or a runner upgrade
//! - **Backfill**: resumable re-enqueue of retryable or stale entries under a
//!   leader lock
//! - **Telemetry**: structured logging, Prometheus metrics and autoscaler
//!   depth gauges
//! - **Migrations**: ordered, recorded schema changes applied at startup
//! - **API**: axum routes over [`service::JobService`]

pub mod api;
pub mod backfill;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod migrations;
pub mod service;
pub mod telemetry;

pub use error::{DsqError, ErrorCode, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backfill::{BackfillController, BackfillReport, BackfillScope};
    pub use crate::cache::{CacheEntry, CacheOutcome, GetOrSchedule, ResultCache};
    pub use crate::config::Config;
    pub use crate::error::{DsqError, ErrorCode, ErrorDetails, ErrorSeverity, Result};
    pub use crate::jobs::{
        ClaimToken, Dispatcher, JobError, JobKey, JobOutcome, JobPriority, JobQueue, JobType,
        QueueEntry, ReportDisposition, WorkerSizeClass,
    };
    pub use crate::service::{JobService, ServiceBackends};
}
