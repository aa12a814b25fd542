// state module: counters, persisted run state, retry ledger and journal
mod counters;
mod db;
mod journal;
mod ledger;
mod persist;

pub use counters::{Counter, CounterSnapshot, CounterStore, ProgressState, RunStatus};
pub use db::{STATE_DB_NAME, StateDb};
pub use journal::CompletedJournal;
pub use ledger::{RetryLedger, RetryRecord};
pub use persist::{
    Autosave, RepositoryRecord, STATE_FILE_NAME, STATE_VERSION, StateDocument, StateManager,
    write_atomic,
};
pub(crate) use persist::atomic_rename_with_retries;
