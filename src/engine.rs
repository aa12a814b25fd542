//! Seams towards the systems that actually move and enumerate data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// One transferable file of a repository. `path` is relative to the
/// repository root and `/`-separated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferUnit {
    pub path: String,
    pub size: u64,
}

impl TransferUnit {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self { path: path.into(), size }
    }
}

/// File count and byte size of a repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub files: u64,
    pub bytes: u64,
}

/// Moves a single unit. Implementations are called from worker threads.
pub trait TransferEngine: Send + Sync {
    /// Returns the number of bytes transferred.
    fn transfer_unit(&self, repository: &str, unit: &TransferUnit) -> Result<u64, TransferError>;
}

/// Enumerates repositories and their units.
pub trait RepositoryLister: Send + Sync {
    fn repositories(&self) -> Result<Vec<String>, TransferError>;

    fn list_all(&self, repository: &str) -> Result<Vec<TransferUnit>, TransferError>;

    /// Units created or modified at or after `since`.
    fn list_changed(
        &self,
        repository: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TransferUnit>, TransferError>;

    fn summarize(&self, repository: &str) -> Result<RepositorySummary, TransferError> {
        let units = self.list_all(repository)?;
        Ok(RepositorySummary {
            files: units.len() as u64,
            bytes: units.iter().map(|u| u.size).sum(),
        })
    }
}
