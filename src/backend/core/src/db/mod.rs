//! PostgreSQL persistence.
//!
//! Production backends for the queue, the cache and the migration store,
//! sharing one `sqlx` pool.

pub mod cache;
pub mod migrations;
pub mod queue;

pub use cache::PgCacheBackend;
pub use migrations::PgMigrationStore;
pub use queue::PgQueueBackend;

use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{DsqError, ErrorCode, Result};

/// Connectivity and pool state reported by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub latency_ms: u64,
    pub pool_size: u32,
    pub idle_connections: u32,
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            DsqError::new(ErrorCode::MissingConfiguration, "database.url is not set")
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                DsqError::from(e)
            })?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database connectivity by executing a simple query.
    pub async fn check_connectivity(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database connectivity check failed");
                DsqError::from(e)
            })?;
        let latency = start.elapsed();
        if latency > Duration::from_millis(100) {
            warn!(
                latency_ms = latency.as_millis() as u64,
                "Database connectivity check latency is high"
            );
        }
        Ok(latency)
    }

    /// Connectivity plus pool usage.
    pub async fn health(&self) -> DatabaseHealth {
        let (connected, latency) = match self.check_connectivity().await {
            Ok(latency) => (true, latency),
            Err(_) => (false, Duration::ZERO),
        };
        DatabaseHealth {
            connected,
            latency_ms: latency.as_millis() as u64,
            pool_size: self.pool.size(),
            idle_connections: self.pool.num_idle() as u32,
        }
    }
}
