//! Connection pools for the record database.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::models::DatabaseConfig;

const MEMORY_URL: &str = "sqlite::memory:";
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
// Background writes for one call can land together.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid database location: {0}")]
    InvalidLocation(String),
    #[error("Failed to create database directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),
    #[error("Failed to open database: {0}")]
    OpenFailed(#[source] sqlx::Error),
    #[error("Database did not answer: {0}")]
    Unreachable(#[source] sqlx::Error),
}

/// `sqlite:` URL for a configured database path.
pub fn database_url(config: &DatabaseConfig) -> String {
    if config.path.starts_with("sqlite:") {
        config.path.clone()
    } else {
        format!("sqlite:{}", config.path)
    }
}

/// Open a WAL-mode pool sized by `config`, creating the file and its
/// directory when missing.
pub async fn open_pool(config: &DatabaseConfig) -> Result<SqlitePool, ConnectionError> {
    let url = database_url(config);
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(|_| ConnectionError::InvalidLocation(config.path.clone()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    create_parent_dir(options.get_filename())?;

    SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .min_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(ConnectionError::OpenFailed)
}

/// Single-connection in-memory pool; every handle sees the same database.
pub async fn in_memory_pool() -> Result<SqlitePool, ConnectionError> {
    let options = SqliteConnectOptions::from_str(MEMORY_URL)
        .map_err(|_| ConnectionError::InvalidLocation(MEMORY_URL.to_string()))?;

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(ConnectionError::OpenFailed)
}

/// Round-trip a trivial statement.
pub async fn ping(pool: &SqlitePool) -> Result<(), ConnectionError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(ConnectionError::Unreachable)?;
    Ok(())
}

fn create_parent_dir(file: &Path) -> Result<(), ConnectionError> {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent).map_err(ConnectionError::DirectoryCreationFailed)
        }
        _ => Ok(()),
    }
}
