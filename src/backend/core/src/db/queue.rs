//! Postgres queue backend.
//!
//! Unicity comes from the unique index on `(entity_id, job_type,
//! params_fingerprint)`. Claims use a single `UPDATE ... WHERE id = (SELECT
//! ... FOR UPDATE SKIP LOCKED)` so concurrent workers never take the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DsqError, Result};
use crate::jobs::{
    ClaimFilter, EnqueueOutcome, JobId, JobKey, JobPriority, JobStatus, QueueBackend, QueueDepth,
    QueueEntry, Revision, StatusCount,
};

const COLUMNS: &str = "id, entity_id, job_type, params_fingerprint, parameters, priority, \
                       worker_size, status, created_at, started_at, attempt_count, revision, force";

/// Attempts at resolving an enqueue that raced with a delete.
const INSERT_ATTEMPTS: usize = 3;

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    entity_id: String,
    job_type: String,
    params_fingerprint: String,
    parameters: serde_json::Value,
    priority: i32,
    worker_size: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    revision: Option<i64>,
    force: bool,
}

impl QueueRow {
    fn into_entry(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            id: JobId(self.id),
            key: JobKey::from_parts(self.entity_id, self.job_type.parse()?, self.params_fingerprint),
            parameters: self.parameters,
            priority: JobPriority(self.priority),
            worker_size: self.worker_size.parse()?,
            status: self.status.parse()?,
            created_at: self.created_at,
            started_at: self.started_at,
            attempt_count: self.attempt_count.max(0) as u32,
            revision: self.revision.map(|r| r.max(0) as Revision),
            force: self.force,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    job_type: String,
    label: String,
    count: i64,
}

/// Queue backend over the `queue_jobs` table.
#[derive(Clone)]
pub struct PgQueueBackend {
    pool: PgPool,
}

impl PgQueueBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn grouped(&self, sql: &str) -> Result<Vec<GroupRow>> {
        Ok(sqlx::query_as::<_, GroupRow>(sql)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl QueueBackend for PgQueueBackend {
    async fn insert_if_absent(&self, entry: QueueEntry) -> Result<EnqueueOutcome> {
        for _ in 0..INSERT_ATTEMPTS {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO queue_jobs (id, entity_id, job_type, params_fingerprint, parameters,
                                        priority, worker_size, status, created_at, attempt_count,
                                        force)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'waiting', $8, $9, $10)
                ON CONFLICT (entity_id, job_type, params_fingerprint) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(entry.id.0)
            .bind(&entry.key.entity_id)
            .bind(entry.key.job_type.as_str())
            .bind(&entry.key.fingerprint)
            .bind(&entry.parameters)
            .bind(entry.priority.value())
            .bind(entry.worker_size.as_str())
            .bind(entry.created_at)
            .bind(entry.attempt_count as i32)
            .bind(entry.force)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                return Ok(EnqueueOutcome::Created(JobId(id)));
            }

            let existing: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM queue_jobs \
                 WHERE entity_id = $1 AND job_type = $2 AND params_fingerprint = $3",
            )
            .bind(&entry.key.entity_id)
            .bind(entry.key.job_type.as_str())
            .bind(&entry.key.fingerprint)
            .fetch_optional(&self.pool)
            .await?;

            // None: the conflicting entry finished in between, insert again.
            if let Some(id) = existing {
                return Ok(EnqueueOutcome::AlreadyPending(JobId(id)));
            }
        }

        Err(DsqError::claim_conflict(format!(
            "Enqueue of {} kept racing with completion",
            entry.key
        )))
    }

    async fn claim(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let job_types: Vec<String> = filter.job_types.iter().map(|t| t.as_str().to_string()).collect();
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET status = 'started', started_at = $3
            WHERE id = (
                SELECT id
                FROM queue_jobs
                WHERE status = 'waiting'
                  AND worker_size = $1
                  AND job_type = ANY($2)
                ORDER BY priority DESC, created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(filter.worker_size.as_str())
            .bind(&job_types)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueRow::into_entry).transpose()
    }

    async fn stamp_revision(&self, key: &JobKey, revision: Revision) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs SET revision = $4 \
             WHERE entity_id = $1 AND job_type = $2 AND params_fingerprint = $3 \
               AND status = 'started'",
        )
        .bind(&key.entity_id)
        .bind(key.job_type.as_str())
        .bind(&key.fingerprint)
        .bind(revision as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &JobKey) -> Result<Option<QueueEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM queue_jobs \
             WHERE entity_id = $1 AND job_type = $2 AND params_fingerprint = $3"
        );
        let row = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(&key.entity_id)
            .bind(key.job_type.as_str())
            .bind(&key.fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueRow::into_entry).transpose()
    }

    async fn requeue(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                started_at = NULL,
                revision = NULL,
                attempt_count = attempt_count + 1
            WHERE entity_id = $1 AND job_type = $2 AND params_fingerprint = $3
              AND status = 'started' AND started_at = $4
            "#,
        )
        .bind(&key.entity_id)
        .bind(key.job_type.as_str())
        .bind(&key.fingerprint)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, key: &JobKey, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE entity_id = $1 AND job_type = $2 AND params_fingerprint = $3 \
               AND status = 'started' AND started_at = $4",
        )
        .bind(&key.entity_id)
        .bind(key.job_type.as_str())
        .bind(&key.fingerprint)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn expired_leases(&self, started_before: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM queue_jobs \
             WHERE status = 'started' AND started_at <= $1 \
             ORDER BY started_at"
        );
        sqlx::query_as::<_, QueueRow>(&sql)
            .bind(started_before)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(QueueRow::into_entry)
            .collect()
    }

    async fn waiting_depths(&self) -> Result<Vec<QueueDepth>> {
        self.grouped(
            "SELECT job_type, worker_size AS label, COUNT(*) AS count \
             FROM queue_jobs WHERE status = 'waiting' GROUP BY job_type, worker_size",
        )
        .await?
        .into_iter()
        .map(|row| {
            Ok(QueueDepth {
                job_type: row.job_type.parse()?,
                worker_size: row.label.parse()?,
                waiting: row.count.max(0) as u64,
            })
        })
        .collect()
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        self.grouped(
            "SELECT job_type, status AS label, COUNT(*) AS count \
             FROM queue_jobs GROUP BY job_type, status",
        )
        .await?
        .into_iter()
        .map(|row| {
            Ok(StatusCount {
                job_type: row.job_type.parse()?,
                status: row.label.parse::<JobStatus>()?,
                count: row.count.max(0) as u64,
            })
        })
        .collect()
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}
