use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, bounded, select, tick};
use serde::{Deserialize, Serialize};

use super::counters::{CounterSnapshot, CounterStore};
use crate::engine::RepositorySummary;
use crate::error::StateError;
use crate::phase::RepoPhaseState;

pub const STATE_VERSION: u32 = 1;
pub const STATE_FILE_NAME: &str = "state.json";

/// Durable per-repository position.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub state: RepoPhaseState,
    /// Start of phase 1; phase 2 transfers what changed after it.
    #[serde(default)]
    pub phase1_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Summary this repository contributed to the run totals.
    #[serde(default)]
    pub counted: Option<RepositorySummary>,
    /// Per-repository counters set aside while another repository ran.
    #[serde(default)]
    pub parked: Option<CounterSnapshot>,
}

/// On-disk form of the whole transfer state.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StateDocument {
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_repository: Option<String>,
    pub counters: CounterSnapshot,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryRecord>,
}

/// Owns the counter store plus repository records and persists both as one
/// document.
pub struct StateManager {
    path: PathBuf,
    counters: Arc<CounterStore>,
    repositories: Mutex<BTreeMap<String, RepositoryRecord>>,
    current: Mutex<Option<String>>,
    // serializes writers of the temp file
    save_lock: Mutex<()>,
}

impl StateManager {
    /// Open the state at `path`. With `ignore_state` any persisted document
    /// is disregarded and the run starts from zero; otherwise an unreadable
    /// document is an error, since resuming from it could not be trusted.
    pub fn open(
        path: impl Into<PathBuf>,
        counters: Arc<CounterStore>,
        ignore_state: bool,
    ) -> Result<Self, StateError> {
        let path = path.into();
        let mut repositories = BTreeMap::new();
        let mut current = None;
        if ignore_state {
            tracing::info!("ignoring prior transfer state at {}", path.display());
        } else if let Some(doc) = Self::load(&path)? {
            tracing::info!(
                "resuming from {} (saved {})",
                path.display(),
                doc.saved_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
            );
            counters.restore(&doc.counters);
            repositories = doc.repositories;
            current = doc.current_repository;
        }
        Ok(Self {
            path,
            counters,
            repositories: Mutex::new(repositories),
            current: Mutex::new(current),
            save_lock: Mutex::new(()),
        })
    }

    /// Read a persisted document. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<StateDocument>, StateError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        let doc: StateDocument = serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if doc.version > STATE_VERSION {
            return Err(StateError::Corrupt {
                path: path.to_path_buf(),
                message: format!("unsupported state version {}", doc.version),
            });
        }
        Ok(Some(doc))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }

    pub fn record(&self, repository: &str) -> RepositoryRecord {
        self.repositories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_record<F>(&self, repository: &str, f: F)
    where
        F: FnOnce(&mut RepositoryRecord),
    {
        let mut repos = self.repositories.lock().unwrap_or_else(PoisonError::into_inner);
        let record = repos.entry(repository.to_string()).or_default();
        f(record);
        record.updated_at = Some(Utc::now());
    }

    pub fn set_current_repository(&self, repository: Option<&str>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
            repository.map(str::to_string);
    }

    pub fn current_repository(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Set the live per-repository counters aside in `repository`'s record
    /// when it is between phases and another repository takes over.
    pub fn park_repository(&self, repository: &str) {
        let mut repos = self.repositories.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = repos.get_mut(repository)
            && record.state.active_phase().is_some()
        {
            record.parked = Some(self.counters.repository_snapshot());
            record.updated_at = Some(Utc::now());
            tracing::debug!("parked counters of {}", repository);
        }
    }

    pub fn document(&self) -> StateDocument {
        let repositories =
            self.repositories.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let current_repository = self.current.lock().unwrap_or_else(PoisonError::into_inner).clone();
        StateDocument {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            current_repository,
            counters: self.counters.snapshot(),
            repositories,
        }
    }

    /// Persist the current document with write-temp, fsync, rename.
    pub fn save(&self) -> Result<(), StateError> {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = self.document();
        let body = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.path, &body)
    }

    /// Move the state document aside once a run has nothing left to resume.
    pub fn archive(&self) -> Result<Option<PathBuf>, StateError> {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.path.exists() {
            return Ok(None);
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new(".")).join("archive");
        std::fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
        let target =
            dir.join(format!("state_{}.json", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        atomic_rename_with_retries(&self.path, &target).map_err(|e| StateError::io(&target, e))?;
        Ok(Some(target))
    }

    /// Save every `interval` on a background thread until the returned
    /// handle is stopped or dropped; a failed save is logged and retried on
    /// the next tick.
    pub fn spawn_autosave(self: &Arc<Self>, interval: Duration) -> Autosave {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let state = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if let Err(e) = state.save() {
                            tracing::warn!("periodic state save failed, will retry: {}", e);
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            if let Err(e) = state.save() {
                tracing::warn!("final state save failed: {}", e);
            }
        });
        Autosave { stop_tx: Some(stop_tx), handle: Some(handle) }
    }
}

/// Handle of the autosave thread. Stopping joins it after a final save.
pub struct Autosave {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Autosave {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write `data` next to `path` under a temporary name, fsync it and rename it
/// over `path`. Readers see either the old or the new content, never a mix.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("state");
    let tmp_path = parent.join(format!("{}.tmp.{}", file_name, std::process::id()));
    let write = || -> std::io::Result<()> {
        let mut f = File::create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StateError::io(&tmp_path, e));
    }
    if let Err(e) = atomic_rename_with_retries(&tmp_path, path) {
        tracing::debug!("rename {} -> {} failed: {:?}", tmp_path.display(), path.display(), e);
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StateError::io(path, e));
    }
    Ok(())
}

/// Rename `tmp_path` onto `target`, retrying a few times when the target is
/// briefly locked or exists (Windows semantics).
pub(crate) fn atomic_rename_with_retries(tmp_path: &Path, target: &Path) -> std::io::Result<()> {
    let mut attempts = 0;
    loop {
        match std::fs::rename(tmp_path, target) {
            Ok(()) => return Ok(()),
            Err(e) => {
                let kind = e.kind();
                if attempts < 2
                    && (kind == std::io::ErrorKind::AlreadyExists
                        || kind == std::io::ErrorKind::PermissionDenied)
                {
                    let _ = std::fs::remove_file(target);
                    std::thread::sleep(Duration::from_millis(50));
                    attempts += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}
