//! Job model.
//!
//! This module provides the core vocabulary shared by the queue, the cache and
//! the backfill controller:
//!
//! - **JobType**: the closed set of processing steps, with stable wire names
//! - **JobKey**: the unicity key `(entity, job type, parameters fingerprint)`
//! - **JobPriority** / **WorkerSizeClass**: dispatch ordering and routing
//! - **QueueEntry**: a Waiting or Started unit of work
//! - **JobOutcome** / **JobError**: what a worker reports back

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DsqError, ErrorCode};

/// Per-entity revision counter. Entities that were never invalidated are at 0.
pub type Revision = u64;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// A processing step of the dataset pipeline.
///
/// The serialized form is the wire name (`/splits`, `/first-rows`, ...),
/// which is also the cache kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "/config-names")]
    ConfigNames,
    #[serde(rename = "/split-names")]
    SplitNames,
    #[serde(rename = "/splits")]
    Splits,
    #[serde(rename = "/first-rows")]
    FirstRows,
    #[serde(rename = "/parquet")]
    Parquet,
    #[serde(rename = "/info")]
    Info,
    #[serde(rename = "/size")]
    Size,
    #[serde(rename = "/statistics")]
    Statistics,
    #[serde(rename = "/duckdb-index")]
    DuckdbIndex,
    #[serde(rename = "/is-valid")]
    IsValid,
}

impl JobType {
    pub const ALL: [JobType; 10] = [
        JobType::ConfigNames,
        JobType::SplitNames,
        JobType::Splits,
        JobType::FirstRows,
        JobType::Parquet,
        JobType::Info,
        JobType::Size,
        JobType::Statistics,
        JobType::DuckdbIndex,
        JobType::IsValid,
    ];

    /// The wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigNames => "/config-names",
            Self::SplitNames => "/split-names",
            Self::Splits => "/splits",
            Self::FirstRows => "/first-rows",
            Self::Parquet => "/parquet",
            Self::Info => "/info",
            Self::Size => "/size",
            Self::Statistics => "/statistics",
            Self::DuckdbIndex => "/duckdb-index",
            Self::IsValid => "/is-valid",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DsqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DsqError::unknown_job_type(s))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Size Class
// ═══════════════════════════════════════════════════════════════════════════════

/// Resource tier a worker pool is provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerSizeClass {
    Light,
    Medium,
    Heavy,
}

impl WorkerSizeClass {
    pub const ALL: [WorkerSizeClass; 3] = [Self::Light, Self::Medium, Self::Heavy];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }
}

impl fmt::Display for WorkerSizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerSizeClass {
    type Err = DsqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "medium" => Ok(Self::Medium),
            "heavy" => Ok(Self::Heavy),
            other => Err(DsqError::validation(format!(
                "Unknown worker size class: {}",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatch priority. Higher values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

impl JobPriority {
    /// Background traffic such as backfill.
    pub const LOW: JobPriority = JobPriority(0);
    /// Interactive requests.
    pub const NORMAL: JobPriority = JobPriority(50);
    /// Operator-escalated work.
    pub const HIGH: JobPriority = JobPriority(100);

    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for JobPriority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Key
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes `value` as JSON with object keys sorted, independent of the map
/// ordering `serde_json` was built with.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical JSON encoding of job parameters.
pub fn canonical_json(parameters: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(parameters, &mut out);
    out
}

/// Lowercase hex SHA-256 of the canonical parameters encoding.
pub fn parameters_fingerprint(parameters: &serde_json::Value) -> String {
    let digest = Sha256::digest(canonical_json(parameters).as_bytes());
    hex::encode(digest)
}

/// Identity of one unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub entity_id: String,
    pub job_type: JobType,
    pub fingerprint: String,
}

impl JobKey {
    /// Build a key, fingerprinting the parameters.
    pub fn new(
        entity_id: impl Into<String>,
        job_type: JobType,
        parameters: &serde_json::Value,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            job_type,
            fingerprint: parameters_fingerprint(parameters),
        }
    }

    /// Rebuild a key from stored parts.
    pub fn from_parts(
        entity_id: impl Into<String>,
        job_type: JobType,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            job_type,
            fingerprint: fingerprint.into(),
        }
    }
}

impl Ord for JobKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entity_id
            .as_bytes()
            .cmp(other.entity_id.as_bytes())
            .then_with(|| self.job_type.as_str().cmp(other.job_type.as_str()))
            .then_with(|| self.fingerprint.cmp(&other.fingerprint))
    }
}

impl PartialOrd for JobKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", self.entity_id, self.job_type, self.fingerprint)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a queue entry. Terminal outcomes delete the entry instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be claimed
    Waiting,
    /// Job has been handed to a worker
    Started,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Started => "started",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DsqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "started" => Ok(Self::Started),
            other => Err(DsqError::with_internal(
                ErrorCode::DeserializationError,
                "Invalid job status in store",
                other.to_string(),
            )),
        }
    }
}

/// A non-terminal unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: JobId,
    pub key: JobKey,
    pub parameters: serde_json::Value,
    pub priority: JobPriority,
    pub worker_size: WorkerSizeClass,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Number of failed attempts so far (retryable failures and reclaimed leases).
    pub attempt_count: u32,
    /// Entity revision observed when the entry was claimed.
    pub revision: Option<Revision>,
    /// Run even if the cached result is already up to date.
    #[serde(default)]
    pub force: bool,
}

impl QueueEntry {
    /// A fresh Waiting entry.
    pub fn waiting(
        key: JobKey,
        parameters: serde_json::Value,
        priority: JobPriority,
        worker_size: WorkerSizeClass,
    ) -> Self {
        Self {
            id: JobId::new(),
            key,
            parameters,
            priority,
            worker_size,
            status: JobStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            attempt_count: 0,
            revision: None,
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn job_type(&self) -> JobType {
        self.key.job_type
    }

    /// Whether the lease on a Started entry has run out at `now`.
    pub fn lease_expired(&self, lease_timeout: Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Started, Some(started_at)) => {
                let lease = chrono::Duration::from_std(lease_timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
                started_at + lease <= now
            }
            _ => false,
        }
    }

    /// Token identifying the current claim, if the entry is Started.
    pub fn claim_token(&self) -> Option<ClaimToken> {
        match (self.status, self.started_at) {
            (JobStatus::Started, Some(started_at)) => Some(ClaimToken {
                key: self.key.clone(),
                job_id: self.id,
                started_at,
            }),
            _ => None,
        }
    }

    /// Whether `token` was issued for the claim this entry is under now.
    ///
    /// A reclaimed and re-claimed entry has a new `started_at`, so tokens from
    /// earlier claims no longer match.
    pub fn is_claimed_by(&self, token: &ClaimToken) -> bool {
        self.status == JobStatus::Started
            && self.id == token.job_id
            && self.key == token.key
            && self.started_at == Some(token.started_at)
    }

    /// Dispatch order: higher priority first, then oldest, then id.
    pub fn dispatch_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Handed to the worker with a claimed job and sent back with its report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub key: JobKey,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Error code written when a lease expires with the retry budget spent.
pub const CRASHED_ERROR_CODE: &str = "JobRunnerCrashedError";
/// Error code reported when a runner exceeds its compute timeout.
pub const TIMEOUT_ERROR_CODE: &str = "JobRunnerExceededMaximumDurationError";
/// Error code for transient network failures reaching the dataset host.
pub const CONNECTION_ERROR_CODE: &str = "ClientConnectionError";

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Retryable (network, rate limit)
    Transient,
    /// Transient failure whose retry budget is spent
    Exhausted,
    /// Never retried (malformed input, unsupported format)
    Permanent,
    /// Store unavailable; not written to the cache
    Infrastructure,
}

impl JobErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Exhausted => "exhausted",
            Self::Permanent => "permanent",
            Self::Infrastructure => "infrastructure",
        }
    }

    /// Whether the automatic and backfill retries may pick this up.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobErrorKind {
    type Err = DsqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "exhausted" => Ok(Self::Exhausted),
            "permanent" => Ok(Self::Permanent),
            "infrastructure" => Ok(Self::Infrastructure),
            other => Err(DsqError::validation(format!("Unknown error kind: {}", other))),
        }
    }
}

/// Error reported by a job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    /// Machine-readable code, kept verbatim (e.g. `ClientConnectionError`)
    pub code: String,
    pub message: String,
    /// Additional context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobError {
    fn new(kind: JobErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Transient, code, message)
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Permanent, code, message)
    }

    pub fn infrastructure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Infrastructure, code, message)
    }

    /// The terminal form of a transient error once retries are exhausted.
    pub fn exhausted(self) -> Self {
        Self {
            kind: JobErrorKind::Exhausted,
            ..self
        }
    }

    /// Add details.
    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.message, self.code, self.kind)
    }
}

impl std::error::Error for JobError {}

impl From<DsqError> for JobError {
    fn from(error: DsqError) -> Self {
        let kind = if error.is_infrastructure() {
            JobErrorKind::Infrastructure
        } else if error.is_retryable() {
            JobErrorKind::Transient
        } else {
            JobErrorKind::Permanent
        };
        Self::new(kind, error.code().to_string(), error.user_message())
    }
}

/// What a worker reports for a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { payload: serde_json::Value },
    Error(JobError),
}

impl JobOutcome {
    pub fn success(payload: serde_json::Value) -> Self {
        Self::Success { payload }
    }
}

impl From<JobError> for JobOutcome {
    fn from(error: JobError) -> Self {
        Self::Error(error)
    }
}

impl From<Result<serde_json::Value, JobError>> for JobOutcome {
    fn from(result: Result<serde_json::Value, JobError>) -> Self {
        match result {
            Ok(payload) => Self::Success { payload },
            Err(error) => Self::Error(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry budget for reported failures and backoff for claim contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// A transient failure is re-queued while `attempt_count < max_attempts`.
    pub max_attempts: u32,
    /// Claim attempts after a contention error before it surfaces.
    pub claim_retries: u32,
    /// Base delay between claim attempts, doubled each time.
    #[serde(with = "humantime_serde")]
    pub claim_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            claim_retries: 5,
            claim_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Whether a transient failure at `attempt_count` is re-queued.
    pub fn should_requeue(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Delay before claim attempt `attempt` (0-indexed), capped at one second.
    pub fn claim_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.claim_backoff
            .saturating_mul(factor)
            .min(Duration::from_secs(1))
    }
}
