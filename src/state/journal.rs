use std::collections::HashSet;

use rusqlite::params;

use super::db::StateDb;
use crate::error::StateError;

/// Units already transferred by phase 1 of an unfinished repository, so an
/// interrupted phase 1 does not send them again.
#[derive(Clone)]
pub struct CompletedJournal {
    db: StateDb,
}

impl CompletedJournal {
    pub(crate) fn new(db: StateDb) -> Self {
        Self { db }
    }

    pub fn mark(&self, repository: &str, path: &str) -> Result<(), StateError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR IGNORE INTO transferred (repository, path) VALUES (?1, ?2)",
            params![repository, path],
        )?;
        Ok(())
    }

    pub fn completed_for(&self, repository: &str) -> Result<HashSet<String>, StateError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT path FROM transferred WHERE repository = ?1")?;
        let rows = stmt.query_map(params![repository], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    /// Forget a repository once it is done.
    pub fn clear(&self, repository: &str) -> Result<(), StateError> {
        let conn = self.db.lock();
        conn.execute("DELETE FROM transferred WHERE repository = ?1", params![repository])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_idempotent_and_clear_is_scoped() {
        let j = StateDb::open_in_memory().unwrap().journal();
        j.mark("a", "x").unwrap();
        j.mark("a", "x").unwrap();
        j.mark("b", "x").unwrap();
        assert_eq!(j.completed_for("a").unwrap().len(), 1);
        j.clear("a").unwrap();
        assert!(j.completed_for("a").unwrap().is_empty());
        assert!(j.completed_for("b").unwrap().contains("x"));
    }
}
