//! Schema migrations.
//!
//! Migrations carry a sortable id (a `YYYYMMDDHHMMSS` timestamp for the
//! built-in set) and run in strictly increasing id order, each inside its
//! own store transaction together with the row that records it. A failed
//! migration is rolled back without being recorded, so the next run picks
//! up from it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dsq_core::db::PgMigrationStore;
//! use dsq_core::migrations::{builtin, MigrationRunner};
//!
//! let runner = MigrationRunner::new(PgMigrationStore::new(db.pool().clone()));
//! let report = runner.apply_all(&builtin()).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument};

use crate::error::{DsqError, Result};

/// A migration that has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Ids applied and skipped by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// One schema change, applied inside a store transaction.
#[async_trait]
pub trait Migration<Tx: Send>: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    async fn up(&self, tx: &mut Tx) -> Result<()>;
}

/// Where applied migrations are recorded.
///
/// Dropping a transaction without committing it must discard its changes.
/// `begin` serialises transactions across every runner sharing the store,
/// so `is_applied` inside a transaction sees migrations committed by others.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    type Tx: Send;

    /// Applied migrations in id order.
    async fn applied(&self) -> Result<Vec<MigrationRecord>>;

    async fn begin(&self) -> Result<Self::Tx>;

    /// Whether `id` is recorded, as seen from inside `tx`.
    async fn is_applied(&self, tx: &mut Self::Tx, id: &str) -> Result<bool>;

    /// Record a migration as applied within `tx`.
    async fn record(&self, tx: &mut Self::Tx, id: &str, description: &str) -> Result<()>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies migrations against a store.
pub struct MigrationRunner<S> {
    store: S,
}

impl<S: MigrationStore> MigrationRunner<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check that ids are non-empty and strictly increasing.
    pub fn validate<M: Migration<S::Tx>>(migrations: &[M]) -> Result<()> {
        if let Some(empty) = migrations.iter().find(|m| m.id().is_empty()) {
            return Err(DsqError::validation(format!(
                "Migration '{}' has an empty id",
                empty.description()
            )));
        }
        for pair in migrations.windows(2) {
            if pair[0].id() >= pair[1].id() {
                return Err(DsqError::migration_order(pair[0].id(), pair[1].id()));
            }
        }
        Ok(())
    }

    /// Apply every migration not yet recorded, in order.
    #[instrument(skip_all, fields(count = migrations.len()))]
    pub async fn apply_all<M: Migration<S::Tx>>(&self, migrations: &[M]) -> Result<MigrationReport> {
        Self::validate(migrations)?;

        let applied: HashSet<String> = self
            .store
            .applied()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect();

        let mut report = MigrationReport::default();
        for migration in migrations {
            let id = migration.id();
            if applied.contains(id) {
                debug!(migration = id, "Migration already applied");
                report.skipped.push(id.to_string());
                continue;
            }

            let started = Instant::now();
            let mut tx = self.store.begin().await?;
            if self.store.is_applied(&mut tx, id).await? {
                debug!(migration = id, "Migration applied by another runner");
                report.skipped.push(id.to_string());
                continue;
            }
            if let Err(e) = migration.up(&mut tx).await {
                error!(migration = id, error = %e, "Migration failed, rolling back");
                return Err(DsqError::migration_failed(id, e.to_string()).with_source(e));
            }
            self.store.record(&mut tx, id, migration.description()).await?;
            self.store.commit(tx).await?;

            info!(
                migration = id,
                description = migration.description(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Migration applied"
            );
            report.applied.push(id.to_string());
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Migrations complete"
        );
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQL Migrations
// ═══════════════════════════════════════════════════════════════════════════════

/// A migration made of SQL statements run in order.
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    pub id: &'static str,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// The schema for the queue, the cache and entity revisions.
///
/// Key columns use the `C` collation so Postgres orders them byte-wise,
/// matching [`crate::jobs::JobKey`] ordering for backfill paging.
pub fn builtin() -> Vec<SqlMigration> {
    vec![
        SqlMigration {
            id: "20240101000000",
            description: "create queue_jobs",
            statements: &[
                r#"CREATE TABLE IF NOT EXISTS queue_jobs (
                    id UUID PRIMARY KEY,
                    entity_id TEXT COLLATE "C" NOT NULL,
                    job_type TEXT COLLATE "C" NOT NULL,
                    params_fingerprint TEXT COLLATE "C" NOT NULL,
                    parameters JSONB NOT NULL,
                    priority INTEGER NOT NULL,
                    worker_size TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    started_at TIMESTAMPTZ,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    revision BIGINT
                )"#,
                "CREATE UNIQUE INDEX IF NOT EXISTS queue_jobs_key_idx \
                 ON queue_jobs (entity_id, job_type, params_fingerprint)",
                "CREATE INDEX IF NOT EXISTS queue_jobs_dispatch_idx \
                 ON queue_jobs (worker_size, status, priority DESC, created_at, id)",
                "CREATE INDEX IF NOT EXISTS queue_jobs_started_idx \
                 ON queue_jobs (started_at) WHERE status = 'started'",
            ],
        },
        SqlMigration {
            id: "20240101000100",
            description: "create cache_entries",
            statements: &[
                r#"CREATE TABLE IF NOT EXISTS cache_entries (
                    entity_id TEXT COLLATE "C" NOT NULL,
                    job_type TEXT COLLATE "C" NOT NULL,
                    params_fingerprint TEXT COLLATE "C" NOT NULL,
                    parameters JSONB NOT NULL,
                    outcome JSONB NOT NULL,
                    kind TEXT NOT NULL,
                    error_code TEXT,
                    retryable BOOLEAN NOT NULL DEFAULT FALSE,
                    revision BIGINT NOT NULL,
                    runner_version INTEGER NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (entity_id, job_type, params_fingerprint)
                )"#,
                "CREATE INDEX IF NOT EXISTS cache_entries_retryable_idx \
                 ON cache_entries (entity_id, job_type, params_fingerprint) WHERE retryable",
                "CREATE INDEX IF NOT EXISTS cache_entries_kind_idx \
                 ON cache_entries (job_type, kind)",
            ],
        },
        SqlMigration {
            id: "20240101000200",
            description: "create entity_revisions",
            statements: &["CREATE TABLE IF NOT EXISTS entity_revisions (
                    entity_id TEXT PRIMARY KEY,
                    revision BIGINT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"],
        },
        SqlMigration {
            id: "20240104085000",
            description: "cache_entries add attempts",
            statements: &[
                "ALTER TABLE cache_entries ADD COLUMN IF NOT EXISTS attempts INTEGER NOT NULL DEFAULT 0",
            ],
        },
        SqlMigration {
            id: "20240215120000",
            description: "queue_jobs add force",
            statements: &[
                "ALTER TABLE queue_jobs ADD COLUMN IF NOT EXISTS force BOOLEAN NOT NULL DEFAULT FALSE",
            ],
        },
    ]
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Staged changes of an in-memory migration transaction.
///
/// Holds the store's transaction lock until committed or dropped.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    statements: Vec<String>,
    records: Vec<MigrationRecord>,
    lock: Option<OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    /// Stage a statement; it becomes visible on commit.
    pub fn execute(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }
}

#[derive(Debug, Default)]
struct InMemoryMigrationState {
    records: Vec<MigrationRecord>,
    executed: Vec<String>,
}

/// Migration store kept in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMigrationStore {
    state: Arc<Mutex<InMemoryMigrationState>>,
    tx_lock: Arc<Mutex<()>>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements committed so far, in order.
    pub async fn executed(&self) -> Vec<String> {
        self.state.lock().await.executed.clone()
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    type Tx = InMemoryTransaction;

    async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        let mut records = self.state.lock().await.records.clone();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTransaction {
            lock: Some(self.tx_lock.clone().lock_owned().await),
            ..Default::default()
        })
    }

    async fn is_applied(&self, _tx: &mut Self::Tx, id: &str) -> Result<bool> {
        Ok(self.state.lock().await.records.iter().any(|r| r.id == id))
    }

    async fn record(&self, tx: &mut Self::Tx, id: &str, description: &str) -> Result<()> {
        tx.records.push(MigrationRecord {
            id: id.to_string(),
            description: description.to_string(),
            applied_at: Utc::now(),
        });
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        let mut state = self.state.lock().await;
        state.executed.extend(tx.statements);
        state.records.extend(tx.records);
        drop(tx.lock);
        Ok(())
    }
}

#[async_trait]
impl Migration<InMemoryTransaction> for SqlMigration {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        self.description
    }

    async fn up(&self, tx: &mut InMemoryTransaction) -> Result<()> {
        for statement in self.statements {
            tx.execute(*statement);
        }
        Ok(())
    }
}
