//! Service errors.
//!
//! [`DsqError`] carries a stable [`ErrorCode`] (numeric code, HTTP status,
//! category and severity), a message safe to return to clients, an optional
//! internal message that only reaches the logs, and structured
//! [`ErrorDetails`]. Every constructed error is counted in
//! `dsq_errors_total`.
//!
//! Outcomes reported by job runners are not service errors; they are
//! [`crate::jobs::JobError`] values and end up in the results cache.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DsqError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable error codes. Clients match on the serialized name or the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Queue (1000-1099)
    JobNotStarted,
    ClaimConflict,
    UnknownJobType,
    WorkerSizeNotAllowed,

    // Backfill (1200-1299)
    BackfillInProgress,

    // Migrations (1300-1399)
    MigrationOrderViolation,
    MigrationFailed,

    // Postgres (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Redis (2100-2199)
    RedisError,
    RedisConnectionFailed,

    // Serialization (2200-2299)
    SerializationError,
    DeserializationError,

    // Requests (4100-4199)
    ValidationError,

    // Configuration (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal (9000-9099)
    InternalError,
    Timeout,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotStarted => 1001,
            Self::ClaimConflict => 1002,
            Self::UnknownJobType => 1003,
            Self::WorkerSizeNotAllowed => 1004,
            Self::BackfillInProgress => 1200,
            Self::MigrationOrderViolation => 1300,
            Self::MigrationFailed => 1301,
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,
            Self::RedisError => 2100,
            Self::RedisConnectionFailed => 2101,
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::ValidationError => 4100,
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
            Self::InternalError => 9000,
            Self::Timeout => 9001,
        }
    }

    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::RecordNotFound => StatusCode::NOT_FOUND,

            // The request raced another transition; the caller should re-read state.
            Self::JobNotStarted
            | Self::ClaimConflict
            | Self::BackfillInProgress
            | Self::DuplicateRecord => StatusCode::CONFLICT,

            Self::UnknownJobType | Self::WorkerSizeNotAllowed | Self::ValidationError => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            Self::DatabaseConnectionFailed | Self::RedisConnectionFailed => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,

            Self::MigrationOrderViolation
            | Self::MigrationFailed
            | Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::RedisError
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether repeating the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClaimConflict
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::RedisConnectionFailed
                | Self::RedisError
                | Self::Timeout
        )
    }

    /// Raised by a backing store rather than by the request or the job.
    pub const fn is_infrastructure(&self) -> bool {
        matches!(self.numeric_code(), 2000..=2199)
    }

    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "queue",
            1200..=1299 => "backfill",
            1300..=1399 => "migration",
            2000..=2099 => "database",
            2100..=2199 => "redis",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }

    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::JobNotStarted
            | Self::UnknownJobType
            | Self::WorkerSizeNotAllowed
            | Self::RecordNotFound
            | Self::DuplicateRecord
            | Self::ValidationError => ErrorSeverity::Low,

            Self::ClaimConflict | Self::BackfillInProgress | Self::Timeout => ErrorSeverity::Medium,

            Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::RedisError
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration => ErrorSeverity::High,

            Self::MigrationOrderViolation
            | Self::MigrationFailed
            | Self::DatabaseConnectionFailed
            | Self::RedisConnectionFailed
            | Self::InternalError => ErrorSeverity::Critical,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Drives the log level and the `severity` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input or a lost race the caller can resolve
    Low,
    /// Contention and timeouts
    Medium,
    /// A store or a config misbehaved
    High,
    /// The process cannot do its job
    Critical,
}

impl ErrorSeverity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured context returned with an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// What the error is about: `job`, `job_type`, `migration`, ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn about(subject: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            subject_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.context.is_empty() && self.retry_after_secs.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service Error
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct DsqError {
    code: ErrorCode,
    /// Returned to clients
    user_message: Cow<'static, str>,
    /// Logged only
    internal_message: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for DsqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl DsqError {
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            "dsq_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "severity" => code.severity().as_str(),
            "retryable" => code.is_retryable().to_string(),
        )
        .increment(1);

        Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), value);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_infrastructure(&self) -> bool {
        self.code.is_infrastructure()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.code.severity()
    }

    /// Log at a level matching the severity. Low severity errors are the
    /// caller's problem and stay at debug.
    pub fn log(&self) {
        let code = self.code.to_string();
        let status = self.http_status().as_u16();
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => tracing::error!(
                error_code = %code,
                category = self.code.category(),
                severity = self.severity().as_str(),
                http_status = status,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "Request failed"
            ),
            ErrorSeverity::Medium => tracing::warn!(
                error_code = %code,
                category = self.code.category(),
                http_status = status,
                user_message = %self.user_message,
                "Request failed"
            ),
            ErrorSeverity::Low => tracing::debug!(
                error_code = %code,
                http_status = status,
                user_message = %self.user_message,
                "Request rejected"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl DsqError {
    /// An outcome was reported for a job that is not currently claimed.
    pub fn job_not_started(key: impl fmt::Display) -> Self {
        let key = key.to_string();
        Self::new(
            ErrorCode::JobNotStarted,
            format!("Job is not started, outcome rejected: {}", key),
        )
        .with_details(ErrorDetails::about("job", key))
    }

    /// A claim lost a race against another claimer.
    pub fn claim_conflict(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::ClaimConflict, "Concurrent claim conflict", message)
    }

    pub fn unknown_job_type(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::UnknownJobType, format!("Unknown job type: {}", name))
            .with_details(ErrorDetails::about("job_type", name))
    }

    pub fn worker_size_not_allowed(job_type: impl fmt::Display, size: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::WorkerSizeNotAllowed,
            format!("Worker size {} cannot run job type {}", size, job_type),
        )
        .with_context("job_type", job_type.to_string())
        .with_context("worker_size", size.to_string())
    }

    pub fn backfill_in_progress() -> Self {
        let mut error =
            Self::new(ErrorCode::BackfillInProgress, "A backfill run is already in progress");
        error.details.retry_after_secs = Some(30);
        error
    }

    pub fn migration_order(previous: &str, next: &str) -> Self {
        Self::new(
            ErrorCode::MigrationOrderViolation,
            format!(
                "Migration ids must be strictly increasing: {} is not after {}",
                next, previous
            ),
        )
        .with_context("previous", previous)
        .with_context("next", next)
    }

    pub fn migration_failed(id: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MigrationFailed,
            format!("Migration {} failed", id),
            reason,
        )
        .with_details(ErrorDetails::about("migration", id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════════════

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&DsqError> for ErrorResponse {
    fn from(error: &DsqError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: (!error.details.is_empty()).then(|| error.details.clone()),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for DsqError {
    fn into_response(self) -> Response {
        self.log();
        (self.http_status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLSTATEs raised when concurrent claimers collide.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for DsqError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "Record not found"),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    (ErrorCode::ClaimConflict, "Concurrent update conflict")
                }
                Some(UNIQUE_VIOLATION) => (ErrorCode::DuplicateRecord, "Record already exists"),
                _ => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for DsqError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::RedisConnectionFailed, "Unable to connect to Redis")
        } else if error.is_timeout() {
            (ErrorCode::RedisError, "Redis operation timed out")
        } else {
            (ErrorCode::RedisError, "A Redis error occurred")
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for DsqError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_io() {
            ErrorCode::SerializationError
        } else {
            ErrorCode::DeserializationError
        };
        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for DsqError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
            _ => ErrorCode::InternalError,
        };
        Self::with_internal(code, "An I/O error occurred", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for DsqError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<DsqError>() {
            Ok(error) => error,
            Err(error) => Self::internal(format!("{:#}", error)),
        }
    }
}

impl From<config::ConfigError> for DsqError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::FileParse { .. } | config::ConfigError::Type { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };
        Self::with_internal(code, user_msg, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorCode::JobNotStarted.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::BackfillInProgress.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::UnknownJobType.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::WorkerSizeNotAllowed.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::DatabaseConnectionFailed.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_retryable_and_infrastructure() {
        assert!(ErrorCode::ClaimConflict.is_retryable());
        assert!(!ErrorCode::ClaimConflict.is_infrastructure());
        assert!(ErrorCode::DatabaseQueryFailed.is_infrastructure());
        assert!(ErrorCode::RedisConnectionFailed.is_infrastructure());
        assert!(!ErrorCode::SerializationError.is_infrastructure());
        assert!(!ErrorCode::JobNotStarted.is_retryable());
    }

    #[test]
    fn test_categories_and_severity() {
        assert_eq!(ErrorCode::BackfillInProgress.category(), "backfill");
        assert_eq!(ErrorCode::MigrationFailed.category(), "migration");
        assert_eq!(ErrorCode::UnknownJobType.category(), "queue");
        assert_eq!(ErrorCode::Timeout.category(), "internal");
        assert_eq!(ErrorCode::ValidationError.severity(), ErrorSeverity::Low);
        assert_eq!(ErrorCode::MigrationFailed.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_response_body() {
        let error = DsqError::unknown_job_type("/nope");
        let json = serde_json::to_value(ErrorResponse::from(&error)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "UNKNOWN_JOB_TYPE");
        assert_eq!(json["error"]["numeric_code"], 1003);
        assert_eq!(json["error"]["details"]["subject_id"], "/nope");
    }

    #[test]
    fn test_empty_details_omitted() {
        let error = DsqError::validation("Entity id cannot be empty");
        let json = serde_json::to_value(ErrorResponse::from(&error)).unwrap();
        assert!(json["error"].get("details").is_none());
    }

    #[test]
    fn test_internal_message_not_returned() {
        let error = DsqError::with_internal(
            ErrorCode::DatabaseError,
            "A database error occurred",
            "connection refused: localhost:5432",
        );
        assert!(error.to_string().contains("localhost:5432"));

        let json = serde_json::to_string(&ErrorResponse::from(&error)).unwrap();
        assert!(!json.contains("localhost:5432"));
    }

    #[test]
    fn test_anyhow_round_trip_keeps_code() {
        let wrapped: anyhow::Error = DsqError::backfill_in_progress().into();
        let error = DsqError::from(wrapped);
        assert_eq!(error.code(), ErrorCode::BackfillInProgress);
        assert_eq!(error.details().retry_after_secs, Some(30));
    }
}
