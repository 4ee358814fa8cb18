//! Cache entries: the last outcome computed for a job key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{JobError, JobErrorKind, JobKey, JobOutcome, JobType, Revision};

/// Stored outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheOutcome {
    Success {
        payload: serde_json::Value,
        computed_at: DateTime<Utc>,
    },
    Error {
        kind: JobErrorKind,
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        computed_at: DateTime<Utc>,
    },
}

impl CacheOutcome {
    pub fn success(payload: serde_json::Value, computed_at: DateTime<Utc>) -> Self {
        Self::Success {
            payload,
            computed_at,
        }
    }

    /// Store a reported error. `retryable` follows the kind.
    pub fn error(error: JobError, computed_at: DateTime<Utc>) -> Self {
        Self::Error {
            retryable: error.kind.is_retryable(),
            kind: error.kind,
            code: error.code,
            message: error.message,
            details: error.details,
            computed_at,
        }
    }

    /// Convert a worker report. Returns `None` for infrastructure errors,
    /// which are never cached.
    pub fn from_report(outcome: JobOutcome, computed_at: DateTime<Utc>) -> Option<Self> {
        match outcome {
            JobOutcome::Success { payload } => Some(Self::success(payload, computed_at)),
            JobOutcome::Error(error) if error.kind == JobErrorKind::Infrastructure => None,
            JobOutcome::Error(error) => Some(Self::error(error, computed_at)),
        }
    }

    /// Label used for grouping: `success` or the error kind.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error { kind, .. } => kind.as_str(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_retryable_error(&self) -> bool {
        matches!(self, Self::Error { retryable: true, .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { code, .. } => Some(code),
        }
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        match self {
            Self::Success { computed_at, .. } | Self::Error { computed_at, .. } => *computed_at,
        }
    }
}

/// A cached result for one job key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: JobKey,
    pub parameters: serde_json::Value,
    pub outcome: CacheOutcome,
    /// Entity revision the result was computed against.
    pub revision: Revision,
    pub runner_version: u32,
    /// How many times the job ran to produce this entry.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn job_type(&self) -> JobType {
        self.key.job_type
    }
}

/// Entries for one `(job type, outcome kind)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCount {
    pub job_type: JobType,
    pub kind: String,
    pub count: u64,
}
