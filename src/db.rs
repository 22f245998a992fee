//! Database module for supportflow
//! SQLite persistence for sessions, tickets, and feedback

use parking_lot::Mutex;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const CURRENT_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Database corruption detected")]
    Corruption,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database handle shared by the session store, ticket orchestrator, and
/// feedback log. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database, used by tests and ephemeral deployments
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the connection while holding the lock
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> SqliteResult<T>,
    ) -> Result<T, DbError> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    /// Initialize schema, running migrations as needed
    pub fn initialize(&self) -> Result<(), DbError> {
        self.check_integrity()?;

        let version = self.schema_version()?;
        if version < CURRENT_SCHEMA_VERSION {
            self.run_migrations(version)?;
        }
        Ok(())
    }

    /// Check database integrity
    pub fn check_integrity(&self) -> Result<(), DbError> {
        let result: String =
            self.with_conn(|c| c.query_row("PRAGMA integrity_check", [], |row| row.get(0)))?;
        if result != "ok" {
            return Err(DbError::Corruption);
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<i32, DbError> {
        self.with_conn(|c| {
            c.execute(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )
        })?;

        let version: Result<String, DbError> = self.with_conn(|c| {
            c.query_row(
                "SELECT value FROM settings WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
        });

        match version {
            Ok(v) => v
                .parse()
                .map_err(|_| DbError::Migration("Invalid schema version".into())),
            Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_schema_version(&self, version: i32) -> Result<(), DbError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO settings (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = ?1",
                [version.to_string()],
            )
        })?;
        Ok(())
    }

    fn run_migrations(&self, from: i32) -> Result<(), DbError> {
        if from < 1 {
            self.migrate_v1()?;
        }
        self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        Ok(())
    }

    /// v1: sessions with version stamps and leases, tickets keyed by
    /// idempotency key, query log and feedback tables
    fn migrate_v1(&self) -> Result<(), DbError> {
        self.with_conn(|c| {
            c.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    user_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_activity TEXT NOT NULL,
                    ttl_secs INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    lease_owner TEXT,
                    lease_expires_at TEXT,
                    PRIMARY KEY (user_id, session_id)
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_last_activity
                    ON sessions (last_activity);

                CREATE TABLE IF NOT EXISTS tickets (
                    idempotency_key TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    external_id TEXT,
                    status TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    description TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tickets_session
                    ON tickets (user_id, session_id);

                CREATE TABLE IF NOT EXISTS query_logs (
                    id TEXT PRIMARY KEY,
                    turn_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    query TEXT NOT NULL,
                    response TEXT NOT NULL,
                    intent TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS feedback (
                    id TEXT PRIMARY KEY,
                    turn_id TEXT NOT NULL,
                    rating INTEGER NOT NULL,
                    comment TEXT,
                    created_at TEXT NOT NULL
                );
                "#,
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let count: i64 = db
            .with_conn(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                     ('sessions', 'tickets', 'query_logs', 'feedback')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.initialize().unwrap();
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("supportflow.db");
        let db = Database::open(&path).unwrap();
        db.initialize().unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
    }
}
