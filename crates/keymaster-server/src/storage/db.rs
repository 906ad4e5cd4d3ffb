//! SQLite database for the Keymaster server.
//!
//! The HTTP endpoint and the admin subcommands may share one database file,
//! so file-backed databases run in WAL mode with a busy timeout. Timestamps
//! are stored as Unix milliseconds throughout.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

/// Connections kept for a database file.
const FILE_POOL_SIZE: u32 = 5;

/// How long a writer waits for another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct KeymasterDatabase {
    pool: Pool<Sqlite>,
}

impl KeymasterDatabase {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let db = Self::connect(options, FILE_POOL_SIZE).await?;
        info!(path = %path.display(), "Keymaster database opened");
        Ok(db)
    }

    /// A private, migrated in-memory database.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        // One connection: every new in-memory connection is a fresh database.
        Self::connect(options, 1).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        debug!(max_connections, "Keymaster schema is current");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

impl std::fmt::Debug for KeymasterDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeymasterDatabase")
            .field("connections", &self.pool.size())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored row that no longer decodes into the wire model.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_databases_are_separate() {
        let a = KeymasterDatabase::open_in_memory().await.unwrap();
        let b = KeymasterDatabase::open_in_memory().await.unwrap();
        a.create_site("A", "10.0.0.1", "", true, 1).await.unwrap();
        assert!(b.get_site_by_ip("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keymaster.db");
        KeymasterDatabase::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn reopened_file_keeps_sites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keymaster.db");
        {
            let db = KeymasterDatabase::open(&path).await.unwrap();
            db.create_site("Shop", "10.0.0.9", "", true, 1).await.unwrap();
            db.pool().close().await;
        }
        let db = KeymasterDatabase::open(&path).await.unwrap();
        assert!(db.get_site_by_ip("10.0.0.9").await.unwrap().is_some());
    }

    #[test]
    fn sqlx_errors_are_query_errors() {
        let err = DatabaseError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DatabaseError::Query(_)));
    }
}
