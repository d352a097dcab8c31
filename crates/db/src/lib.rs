// crates/db/src/lib.rs
//! SQLite index store for claude-remote.
//!
//! Single-writer, many-readers: all mutations go through the ingest
//! operations in [`ingest`] (plus push-subscription writes in
//! [`queries::push`]); every write path is one transaction. Readers use the
//! same pool and see transaction-consistent snapshots under WAL.

pub mod ingest;
mod migrations;
pub mod queries;

pub use ingest::{AppliedBatch, IngestFileState, InsertedMessage};
pub use queries::analytics::{RollupGroup, TokenBucket, ToolShare};
pub use queries::dashboard::{ActivityItem, PeriodStats};
pub use queries::push::PushSubscriptionRow;
pub use queries::search::SearchHit;
pub use queries::sessions::{
    ConversationMessage, ConversationPage, FileTouch, IdleCandidate, SessionDetail, SessionFilter,
    SessionPage, SessionRow,
};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error("Ingest offset for {path} may only advance (current {current}, requested {requested})")]
    OffsetRegression {
        path: String,
        current: i64,
        requested: i64,
    },
}

pub type DbResult<T> = Result<T, DbError>;

/// Main database handle wrapping a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30))
            .log_slow_statements(
                tracing::log::LevelFilter::Warn,
                std::time::Duration::from_secs(5),
            );

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            db_path: path.to_owned(),
        };
        db.run_migrations().await?;

        info!("Index database opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub async fn open_in_memory() -> DbResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let db = Self {
            pool,
            db_path: PathBuf::new(),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending inline migrations.
    ///
    /// A `_migrations` table tracks applied versions so non-idempotent
    /// statements only execute once.
    async fn run_migrations(&self) -> DbResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
            .fetch_one(&self.pool)
            .await?;
        let current_version = row.0 as usize;

        for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i + 1;
            if version > current_version {
                sqlx::query(migration).execute(&self.pool).await?;
                sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path to the database file (empty for in-memory databases).
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_database_has_all_tables() {
        let db = Database::open_in_memory().await.expect("in-memory db");

        for table in [
            "sessions",
            "messages",
            "tool_uses",
            "file_events",
            "push_subscriptions",
            "ingest_state",
        ] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap_or_else(|e| panic!("table {table} should exist: {e}"));
            assert_eq!(count.0, 0);
        }

        // FTS shadow exists and is queryable
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages_fts")
            .fetch_one(db.pool())
            .await
            .expect("messages_fts should exist");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Database::open_in_memory().await.expect("first open");
        db.run_migrations().await.expect("second run");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(db.pool())
            .await
            .expect("sessions table still exists");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn file_based_database() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let db_path = tmp.path().join("index.db");

        let _db = Database::open(&db_path).await.expect("file-based db");
        assert!(db_path.exists(), "database file should exist on disk");
    }
}
