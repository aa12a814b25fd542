use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use super::journal::CompletedJournal;
use super::ledger::RetryLedger;
use crate::error::StateError;

pub const STATE_DB_NAME: &str = "state.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS retries (
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    reason TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (repository, path)
);
CREATE TABLE IF NOT EXISTS transferred (
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    PRIMARY KEY (repository, path)
);
";

/// SQLite file holding the retry ledger and the completed-unit journal.
/// The connection is shared behind a mutex; workers append concurrently.
#[derive(Clone)]
pub struct StateDb {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl StateDb {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!("state db {} journal_mode={}", path.display(), mode);
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Drop whatever the file held and start empty. Used when the run was
    /// asked to ignore prior state.
    pub fn open_fresh(path: &Path) -> Result<Self, StateError> {
        for suffix in ["", "-wal", "-shm"] {
            let p = PathBuf::from(format!("{}{}", path.display(), suffix));
            match std::fs::remove_file(&p) {
                Ok(()) => tracing::debug!("removed prior state file {}", p.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StateError::io(p, e)),
            }
        }
        Self::open(path)
    }

    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StateError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ledger(&self) -> RetryLedger {
        RetryLedger::new(self.clone())
    }

    pub fn journal(&self) -> CompletedJournal {
        CompletedJournal::new(self.clone())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fresh_discards_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_DB_NAME);
        {
            let db = StateDb::open(&path).unwrap();
            db.ledger()
                .append(&crate::state::RetryRecord::new("repo-a", "a.jar", "boom"))
                .unwrap();
            assert_eq!(db.ledger().count_all().unwrap(), 1);
        }
        let reopened = StateDb::open(&path).unwrap();
        assert_eq!(reopened.ledger().count_all().unwrap(), 1);
        drop(reopened);

        let fresh = StateDb::open_fresh(&path).unwrap();
        assert_eq!(fresh.ledger().count_all().unwrap(), 0);
        assert_eq!(fresh.path(), Some(path.as_path()));
    }
}
