//! Postgres cache backend.
//!
//! The outcome is stored as JSONB; `kind`, `error_code` and `retryable` are
//! denormalised next to it so backfill scans and counts stay index-backed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::cache::{CacheBackend, CacheCount, CacheEntry, CacheFilter, CacheOutcome};
use crate::error::Result;
use crate::jobs::{JobKey, Revision};

const COLUMNS: &str = "entity_id, job_type, params_fingerprint, parameters, outcome, \
                       revision, runner_version, attempts, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    entity_id: String,
    job_type: String,
    params_fingerprint: String,
    parameters: serde_json::Value,
    outcome: serde_json::Value,
    revision: i64,
    runner_version: i32,
    attempts: i32,
    updated_at: DateTime<Utc>,
}

impl CacheRow {
    fn into_entry(self) -> Result<CacheEntry> {
        Ok(CacheEntry {
            key: JobKey::from_parts(self.entity_id, self.job_type.parse()?, self.params_fingerprint),
            parameters: self.parameters,
            outcome: serde_json::from_value::<CacheOutcome>(self.outcome)?,
            revision: self.revision.max(0) as Revision,
            runner_version: self.runner_version.max(0) as u32,
            attempts: self.attempts.max(0) as u32,
            updated_at: self.updated_at,
        })
    }
}

/// Cache backend over `cache_entries` and `entity_revisions`.
#[derive(Clone)]
pub struct PgCacheBackend {
    pool: PgPool,
}

impl PgCacheBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheBackend for PgCacheBackend {
    async fn get(&self, key: &JobKey) -> Result<Option<CacheEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM cache_entries \
             WHERE entity_id = $1 AND job_type = $2 AND params_fingerprint = $3"
        );
        let row = sqlx::query_as::<_, CacheRow>(&sql)
            .bind(&key.entity_id)
            .bind(key.job_type.as_str())
            .bind(&key.fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CacheRow::into_entry).transpose()
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let outcome = serde_json::to_value(&entry.outcome)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (entity_id, job_type, params_fingerprint, parameters, outcome,
                                       kind, error_code, retryable, revision, runner_version,
                                       attempts, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (entity_id, job_type, params_fingerprint) DO UPDATE SET
                parameters = EXCLUDED.parameters,
                outcome = EXCLUDED.outcome,
                kind = EXCLUDED.kind,
                error_code = EXCLUDED.error_code,
                retryable = EXCLUDED.retryable,
                revision = EXCLUDED.revision,
                runner_version = EXCLUDED.runner_version,
                attempts = EXCLUDED.attempts,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&entry.key.entity_id)
        .bind(entry.key.job_type.as_str())
        .bind(&entry.key.fingerprint)
        .bind(&entry.parameters)
        .bind(outcome)
        .bind(entry.outcome.kind_label())
        .bind(entry.outcome.error_code())
        .bind(entry.outcome.is_retryable_error())
        .bind(entry.revision as i64)
        .bind(entry.runner_version as i32)
        .bind(entry.attempts as i32)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn current_revision(&self, entity_id: &str) -> Result<Revision> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM entity_revisions WHERE entity_id = $1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(revision.unwrap_or(0).max(0) as Revision)
    }

    async fn bump_revision(&self, entity_id: &str) -> Result<Revision> {
        let revision: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO entity_revisions (entity_id, revision, updated_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (entity_id) DO UPDATE SET
                revision = entity_revisions.revision + 1,
                updated_at = NOW()
            RETURNING revision
            "#,
        )
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(revision.max(0) as Revision)
    }

    async fn scan(
        &self,
        filter: &CacheFilter,
        after: Option<&JobKey>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM cache_entries
            WHERE ($1::text IS NULL OR job_type = $1)
              AND ($2::text IS NULL OR entity_id = $2)
              AND ($3::text IS NULL OR error_code = $3)
              AND (NOT $4 OR retryable)
              AND ($5::text IS NULL OR (entity_id, job_type, params_fingerprint) > ($5, $6, $7))
            ORDER BY entity_id, job_type, params_fingerprint
            LIMIT $8
            "#
        );

        sqlx::query_as::<_, CacheRow>(&sql)
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.entity_id.as_deref())
            .bind(filter.error_code.as_deref())
            .bind(filter.retryable_only)
            .bind(after.map(|k| k.entity_id.as_str()))
            .bind(after.map(|k| k.job_type.as_str()))
            .bind(after.map(|k| k.fingerprint.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CacheRow::into_entry)
            .collect()
    }

    async fn counts(&self) -> Result<Vec<CacheCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT job_type, kind, COUNT(*) FROM cache_entries GROUP BY job_type, kind",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(job_type, kind, count)| {
                Ok(CacheCount {
                    job_type: job_type.parse()?,
                    kind,
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
