//! SQLite connection handling and migrations.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use wuhu_domain::error::{Error, Result};

/// Shared handle to the process-wide SQLite database.
///
/// All access goes through [`Database::run`], which executes the closure on
/// the blocking pool while holding the connection mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and migrate to the latest
    /// schema. Migrations are forward-only; fresh deployments start at the
    /// latest version.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let mut conn = Connection::open(&path)?;
            configure(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let mut conn = Connection::open_in_memory()?;
            configure(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    pub(crate) async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("database mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)
    }
}

pub(crate) fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn configure(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "FULL")?;
    migrations()
        .to_latest(conn)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    Ok(())
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE sessions (
            id                 TEXT PRIMARY KEY,
            provider           TEXT NOT NULL,
            model              TEXT NOT NULL,
            reasoning_effort   TEXT,
            environment_json   TEXT NOT NULL,
            cwd                TEXT NOT NULL,
            parent_session_id  TEXT,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            head_entry_id      INTEGER,
            tail_entry_id      INTEGER
        );

        CREATE TABLE entries (
            session_id       TEXT NOT NULL REFERENCES sessions(id),
            entry_id         INTEGER NOT NULL,
            parent_entry_id  INTEGER,
            created_at       TEXT NOT NULL,
            payload_json     TEXT NOT NULL,
            PRIMARY KEY (session_id, entry_id)
        );

        CREATE TABLE queue_items (
            session_id   TEXT NOT NULL,
            lane         TEXT NOT NULL,
            item_id      INTEGER NOT NULL,
            enqueued_at  TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            state        TEXT NOT NULL,
            PRIMARY KEY (session_id, lane, item_id)
        );

        CREATE TABLE queue_journal (
            session_id TEXT NOT NULL,
            lane       TEXT NOT NULL,
            seq        INTEGER NOT NULL,
            kind       TEXT NOT NULL,
            data_json  TEXT NOT NULL,
            at         TEXT NOT NULL,
            PRIMARY KEY (session_id, lane, seq)
        );

        CREATE INDEX idx_entries_session_created ON entries(session_id, created_at);
        CREATE INDEX idx_sessions_updated ON sessions(updated_at DESC);
        "#,
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[tokio::test]
    async fn open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();
        let count: i64 = db
            .run(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                     ('sessions', 'entries', 'queue_items', 'queue_journal')",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(count, 4);
    }
}
