use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::db::StateDb;
use crate::error::StateError;

/// One failed transfer unit awaiting retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    pub repository: String,
    pub path: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl RetryRecord {
    pub fn new(repository: &str, path: &str, reason: impl Into<String>) -> Self {
        Self {
            repository: repository.to_string(),
            path: path.to_string(),
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Durable record of failed units, keyed by `(repository, path)`.
///
/// The number of live records for a repository is the authoritative failure
/// count; in-memory counters only cache it.
#[derive(Clone)]
pub struct RetryLedger {
    db: StateDb,
}

impl RetryLedger {
    pub(crate) fn new(db: StateDb) -> Self {
        Self { db }
    }

    /// Record a failure. A record for the same unit is replaced.
    pub fn append(&self, record: &RetryRecord) -> Result<(), StateError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO retries (repository, path, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.repository,
                record.path,
                record.reason,
                record.recorded_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Drop the record of a unit that has since transferred. Returns whether
    /// a record existed.
    pub fn remove(&self, repository: &str, path: &str) -> Result<bool, StateError> {
        let conn = self.db.lock();
        let n = conn.execute(
            "DELETE FROM retries WHERE repository = ?1 AND path = ?2",
            params![repository, path],
        )?;
        Ok(n > 0)
    }

    pub fn contains(&self, repository: &str, path: &str) -> Result<bool, StateError> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM retries WHERE repository = ?1 AND path = ?2",
            params![repository, path],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn count_for(&self, repository: &str) -> Result<u64, StateError> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM retries WHERE repository = ?1",
            params![repository],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn count_all(&self) -> Result<u64, StateError> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM retries", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Records of one repository ordered by path. Each call re-reads the
    /// table, so the listing can be restarted.
    pub fn list_for(&self, repository: &str) -> Result<Vec<RetryRecord>, StateError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT repository, path, reason, recorded_at FROM retries
             WHERE repository = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![repository], |row| {
            let recorded: String = row.get(3)?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            Ok(RetryRecord {
                repository: row.get(0)?,
                path: row.get(1)?,
                reason: row.get(2)?,
                recorded_at,
            })
        })?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    /// Pending failure count per repository, for status output.
    pub fn repositories(&self) -> Result<Vec<(String, u64)>, StateError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT repository, COUNT(*) FROM retries GROUP BY repository ORDER BY repository",
        )?;
        let rows =
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Total failures over a set of repositories.
    pub fn count_over<'a, I>(&self, repositories: I) -> Result<u64, StateError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut total = 0;
        for repo in repositories {
            total += self.count_for(repo)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> RetryLedger {
        StateDb::open_in_memory().expect("in-memory db").ledger()
    }

    #[test]
    fn append_is_idempotent_last_write_wins() {
        let l = ledger();
        l.append(&RetryRecord::new("repo-a", "org/a.jar", "timeout")).unwrap();
        l.append(&RetryRecord::new("repo-a", "org/a.jar", "502")).unwrap();
        assert_eq!(l.count_for("repo-a").unwrap(), 1);
        let list = l.list_for("repo-a").unwrap();
        assert_eq!(list[0].reason, "502");
    }

    #[test]
    fn remove_and_count_per_repository() {
        let l = ledger();
        l.append(&RetryRecord::new("repo-a", "b", "x")).unwrap();
        l.append(&RetryRecord::new("repo-a", "a", "x")).unwrap();
        l.append(&RetryRecord::new("repo-b", "a", "x")).unwrap();
        assert!(l.remove("repo-a", "b").unwrap());
        assert!(!l.remove("repo-a", "b").unwrap());
        assert_eq!(l.count_for("repo-a").unwrap(), 1);
        assert_eq!(l.count_for("repo-b").unwrap(), 1);
        assert_eq!(l.count_for("repo-c").unwrap(), 0);
        assert_eq!(l.count_all().unwrap(), 2);
        assert_eq!(
            l.repositories().unwrap(),
            vec![("repo-a".to_string(), 1), ("repo-b".to_string(), 1)]
        );
    }

    #[test]
    fn list_is_ordered_and_restartable() {
        let l = ledger();
        for p in ["c", "a", "b"] {
            l.append(&RetryRecord::new("r", p, "x")).unwrap();
        }
        let first: Vec<String> = l.list_for("r").unwrap().into_iter().map(|r| r.path).collect();
        let second: Vec<String> = l.list_for("r").unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(first, vec!["a", "b", "c"]);
        assert_eq!(first, second);
    }
}
