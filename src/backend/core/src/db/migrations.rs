//! Postgres migration store.
//!
//! Applied migrations live in `schema_migrations`. Each migration runs in a
//! transaction holding an advisory lock and re-checks `schema_migrations`
//! under it, so two servers starting together apply it once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;
use crate::migrations::{Migration, MigrationRecord, MigrationStore, SqlMigration};

/// Advisory lock key shared by every dsq server ("dsq" in ASCII).
const MIGRATION_LOCK_KEY: i64 = 0x0064_7371;

pub type PgTransaction = Transaction<'static, Postgres>;

/// Migration store over `schema_migrations`.
#[derive(Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    type Tx = PgTransaction;

    async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        self.ensure_table().await?;
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, description, applied_at FROM schema_migrations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, description, applied_at)| MigrationRecord {
                id,
                description,
                applied_at,
            })
            .collect())
    }

    async fn begin(&self) -> Result<Self::Tx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn is_applied(&self, tx: &mut Self::Tx, id: &str) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT id FROM schema_migrations WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(found.is_some())
    }

    async fn record(&self, tx: &mut Self::Tx, id: &str, description: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO schema_migrations (id, description, applied_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(description)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Migration<PgTransaction> for SqlMigration {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        self.description
    }

    async fn up(&self, tx: &mut PgTransaction) -> Result<()> {
        for statement in self.statements {
            sqlx::query(statement).execute(&mut **tx).await?;
        }
        Ok(())
    }
}
