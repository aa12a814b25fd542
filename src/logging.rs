//! Tracing setup for the `axf` binary.
//!
//! Short commands log to stderr. A transfer run writes its log to a
//! per-session file so events never tear the progress display; the
//! returned [`SessionLog`] keeps the non-blocking writer alive until the
//! progress orchestrator closes it. Events after that go to stderr.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::EitherWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::ProgressError;

fn filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    // RUST_LOG wins over the flag
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("artxfer={},axf={}", level, level)))
}

/// Install the global subscriber. With `log_dir` set, events go to a fresh
/// `axf-<timestamp>.log` file inside it and the session handle is returned.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<SessionLog>> {
    let Some(dir) = log_dir else {
        let res = tracing_subscriber::registry()
            .with(filter(verbose))
            .with(fmt::layer().with_writer(std::io::stderr).with_target(verbose))
            .try_init();
        if let Err(e) = res {
            tracing::debug!("subscriber already installed: {}", e);
        }
        return Ok(None);
    };
    let session = SessionLog::create(dir)?.attach_writer();
    let writer = session.writer();
    let res = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(verbose),
        )
        .try_init();
    if let Err(e) = res {
        tracing::debug!("subscriber already installed, session log stays empty: {}", e);
    }
    Ok(Some(session))
}

/// Writer handed to the subscriber: the session file while it is open,
/// stderr once it has been closed.
#[derive(Clone, Default)]
pub struct SessionWriter {
    file: Arc<Mutex<Option<NonBlocking>>>,
}

impl SessionWriter {
    fn set(&self, writer: Option<NonBlocking>) {
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = writer;
    }

    pub fn is_file(&self) -> bool {
        self.file.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl<'a> MakeWriter<'a> for SessionWriter {
    type Writer = EitherWriter<NonBlocking, std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        match self.file.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(w) => EitherWriter::A(w.clone()),
            None => EitherWriter::B(std::io::stderr()),
        }
    }
}

/// Auxiliary log file of one transfer session.
pub struct SessionLog {
    path: PathBuf,
    writer: SessionWriter,
    guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog").field("path", &self.path).field("open", &self.guard.is_some()).finish()
    }
}

impl SessionLog {
    /// Create an empty session file under `dir` without installing a writer.
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let name = format!("axf-{}.log", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let path = dir.join(name);
        std::fs::File::create(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self { path, writer: SessionWriter::default(), guard: None })
    }

    /// Start the non-blocking appender that feeds the session file.
    pub fn attach_writer(mut self) -> Self {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, self.file_name()));
        self.writer.set(Some(writer));
        self.guard = Some(guard);
        self
    }

    /// Handle for the subscriber; it outlives the session and falls back to
    /// stderr after `close`.
    pub fn writer(&self) -> SessionWriter {
        self.writer.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_name(&self) -> String {
        self.path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
    }

    /// Flush pending events and sync the file to disk.
    pub fn close(mut self) -> Result<(), ProgressError> {
        self.writer.set(None);
        // dropping the guard drains the background writer
        drop(self.guard.take());
        let sync = std::fs::OpenOptions::new().append(true).open(&self.path).and_then(|f| f.sync_all());
        sync.map_err(|source| ProgressError::SessionLog { path: self.path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_log_closes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        assert!(log.path().exists());
        assert!(log.path().starts_with(dir.path()));
        log.close().unwrap();
    }

    #[test]
    fn events_after_close_go_to_stderr() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap().attach_writer();
        let writer = log.writer();
        assert!(writer.is_file());
        assert!(matches!(writer.make_writer(), EitherWriter::A(_)));
        writer.make_writer().write_all(b"before close\n").unwrap();
        let path = log.path().to_path_buf();
        log.close().unwrap();
        assert!(!writer.is_file());
        assert!(matches!(writer.make_writer(), EitherWriter::B(_)));
        writer.make_writer().write_all(b"after close\n").unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "before close\n");
    }

    #[test]
    fn close_reports_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        std::fs::remove_file(log.path()).unwrap();
        assert!(matches!(log.close(), Err(ProgressError::SessionLog { .. })));
    }
}
