//! Configuration management.
//!
//! Sources, later ones overriding earlier ones:
//! 1. an optional file (`--config` or `DSQ_CONFIG_FILE`)
//! 2. environment variables with the `DSQ` prefix and `__` separator,
//!    e.g. `DSQ__QUEUE__LEASE_TIMEOUT=10m`

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::backfill::BackfillConfig;
use crate::error::{DsqError, Result};
use crate::jobs::{CapabilityTable, JobPriority, JobType, RetryPolicy, WorkerConfig, WorkerSizeClass};
use crate::telemetry::{AutoscalerConfig, TelemetryConfig};

/// Environment variable naming a config file.
pub const CONFIG_FILE_ENV: &str = "DSQ_CONFIG_FILE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue and retry configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Results cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Backfill configuration
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Autoscaler signal configuration
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,

    /// Worker started by [`JobService::start_worker`](crate::service::JobService::start_worker).
    /// The HTTP server runs no worker of its own; workers pull over the API
    /// or embed the library.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging and metrics configuration
    #[serde(default)]
    pub observability: TelemetryConfig,

    /// Allowed worker sizes per job type, replacing the built-in set
    #[serde(default)]
    pub capabilities: HashMap<JobType, Vec<WorkerSizeClass>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; in-memory stores are used when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Time to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; the backfill lock is process-local when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for lock keys
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            lock_prefix: default_lock_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Requeues allowed per job before a transient error becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Started jobs older than this are reclaimed
    #[serde(default = "default_lease_timeout", with = "humantime_serde")]
    pub lease_timeout: Duration,

    /// How often expired leases are looked for
    #[serde(default = "default_reclaim_interval", with = "humantime_serde")]
    pub reclaim_interval: Duration,

    /// Retries of a contended claim
    #[serde(default = "default_claim_retries")]
    pub claim_retries: u32,

    /// First delay between claim retries
    #[serde(default = "default_claim_backoff", with = "humantime_serde")]
    pub claim_backoff: Duration,

    /// Priority of jobs submitted without one
    #[serde(default)]
    pub default_priority: JobPriority,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lease_timeout: default_lease_timeout(),
            reclaim_interval: default_reclaim_interval(),
            claim_retries: default_claim_retries(),
            claim_backoff: default_claim_backoff(),
            default_priority: JobPriority::default(),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            claim_retries: self.claim_retries,
            claim_backoff: self.claim_backoff,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Priority of jobs scheduled by a cache miss
    #[serde(default)]
    pub miss_priority: JobPriority,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            miss_priority: JobPriority::default(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_lock_prefix() -> String { "dsq:lock:".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_lease_timeout() -> Duration { Duration::from_secs(10 * 60) }
fn default_reclaim_interval() -> Duration { Duration::from_secs(60) }
fn default_claim_retries() -> u32 { 5 }
fn default_claim_backoff() -> Duration { Duration::from_millis(10) }

impl Config {
    /// Load configuration from an optional file and the environment.
    ///
    /// Without an explicit path, `DSQ_CONFIG_FILE` is consulted.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_FILE_ENV).ok();
        let path = path.or(env_path.as_deref().map(Path::new));

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("DSQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field rules.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(DsqError::configuration("queue.max_attempts must be at least 1"));
        }
        if self.queue.lease_timeout.is_zero() {
            return Err(DsqError::configuration("queue.lease_timeout must be non-zero"));
        }
        if self.queue.reclaim_interval.is_zero() || self.autoscaler.refresh_interval.is_zero() {
            return Err(DsqError::configuration("Scheduler intervals must be non-zero"));
        }
        if self.backfill.priority >= JobPriority::NORMAL {
            return Err(DsqError::configuration(format!(
                "backfill.priority ({}) must be below the interactive priority ({})",
                self.backfill.priority,
                JobPriority::NORMAL
            )));
        }
        if self.backfill.enabled && self.backfill.interval.is_zero() {
            return Err(DsqError::configuration("backfill.interval must be non-zero"));
        }
        if self.backfill.page_size == 0 {
            return Err(DsqError::configuration("backfill.page_size must be at least 1"));
        }
        if self.worker.concurrency == 0 {
            return Err(DsqError::configuration("worker.concurrency must be at least 1"));
        }
        self.capability_table()?;
        Ok(())
    }

    /// The built-in capability table with configured size overrides applied.
    pub fn capability_table(&self) -> Result<CapabilityTable> {
        CapabilityTable::builtin().with_size_overrides(&self.capabilities)
    }

    /// Socket address the HTTP server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.backfill.priority, JobPriority::LOW);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_backfill_priority_must_be_below_normal() {
        let mut config = Config::default();
        config.backfill.priority = JobPriority::NORMAL;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
