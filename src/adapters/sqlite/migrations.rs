//! Embedded schema migrations for the record database.

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to apply migration {version}: {source}")]
    Apply { version: i64, #[source] source: sqlx::Error },
    #[error("Failed to read schema history: {0}")]
    History(#[source] sqlx::Error),
}

/// One schema step, compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

const EMBEDDED: [Migration; 2] = [
    Migration {
        version: 1,
        description: "JSON document records table",
        sql: include_str!("../../../migrations/001_records.sql"),
    },
    Migration {
        version: 2,
        description: "Index leads by phone number",
        sql: include_str!("../../../migrations/002_lead_phone_index.sql"),
    },
];

pub fn all_embedded_migrations() -> Vec<Migration> {
    EMBEDDED.to_vec()
}

/// A row of `schema_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub applied_at: String,
}

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply, in version order, every migration newer than the recorded
    /// schema version. Returns how many ran.
    pub async fn run_embedded_migrations(&self, mut migrations: Vec<Migration>) -> Result<usize, MigrationError> {
        self.ensure_history_table().await?;
        let current = self.get_current_version().await?;

        migrations.retain(|m| m.version > current);
        migrations.sort_by_key(|m| m.version);
        for migration in &migrations {
            self.apply(migration).await?;
        }

        Ok(migrations.len())
    }

    /// Highest applied version, 0 for a fresh database.
    pub async fn get_current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_history_table().await?;
        let (version,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await
            .map_err(MigrationError::History)?;
        Ok(version)
    }

    /// Applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_history_table().await?;
        sqlx::query_as::<_, AppliedMigration>(
            "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(MigrationError::History)
    }

    async fn ensure_history_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(MigrationError::History)?;
        Ok(())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let failed = |source| MigrationError::Apply {
            version: migration.version,
            source,
        };

        let mut tx = self.pool.begin().await.map_err(failed)?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await.map_err(failed)?;
        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
        tx.commit().await.map_err(failed)?;

        info!(version = migration.version, description = migration.description, "applied migration");
        Ok(())
    }
}
