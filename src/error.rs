//! Repository-wide structured errors for the transfer orchestration core.

use std::path::PathBuf;

use crate::state::Counter;

/// Errors raised by the progress orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// A phase id outside the registered range. Caller bug, not user-recoverable.
    #[error("{op}: invalid phase id {id} (registered phases: {registered})")]
    InvalidPhaseIndex { op: &'static str, id: usize, registered: usize },
    /// Rendering could not be set up; nothing was created and the caller may
    /// retry or fall back to a headless renderer.
    #[error("progress display unavailable: {0}")]
    Init(String),
    /// The retry ledger could not be read while seeding the failure count.
    #[error("cannot read retry ledger: {0}")]
    Ledger(#[from] StateError),
    #[error("failed to close progress session log {path}: {source}")]
    SessionLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProgressError {
    /// `Init` failures leave no partial state behind and can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProgressError::Init(_))
    }
}

/// Errors from the counter store, persisted state file and SQLite ledger.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("total for {0:?} already set in this phase")]
    AlreadySet(Counter),
    #[error("{0:?} is not a phase total")]
    NotATotal(Counter),
    #[error("persisted state {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io { path: path.into(), source }
    }
}

/// Failure of a single transfer unit, as reported by a transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("source unit missing: {0}")]
    SourceMissing(String),
    #[error("read failed for {path}: {message}")]
    Read { path: String, message: String },
    #[error("write failed for {path}: {message}")]
    Write { path: String, message: String },
    #[error("remote service throttled the request: {0}")]
    Throttled(String),
    #[error("target repository unavailable: {0}")]
    TargetUnavailable(String),
    #[error("transfer failed: {0}")]
    Other(String),
}

impl TransferError {
    /// Fatal errors stop the whole run; everything else is recorded in the
    /// retry ledger and retried in phase 3 or a later run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::TargetUnavailable(_))
    }

    /// Whether an immediate in-engine retry may help (transient IO/network).
    pub fn is_retriable(&self) -> bool {
        use TransferError::*;
        match self {
            Read { .. } | Write { .. } | Throttled(_) => true,
            SourceMissing(_) | TargetUnavailable(_) | Other(_) => false,
        }
    }

    /// Short reason stored in the retry ledger.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
