pub mod cli;
pub mod commands;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod local;
pub mod logging;
pub mod phase;
pub mod pool;
pub mod progress;
pub mod sequencer;
pub mod state;
pub mod util;

pub use error::{ProgressError, StateError, TransferError};
pub use progress::ProgressOrchestrator;
pub use state::{Counter, CounterStore};
