use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Every numeric counter the run keeps.
///
/// The first four form the run-wide `RunStatus`; the `Phase1*`, `Total*`
/// diff and transferred counters form the per-repository `ProgressState` and
/// are zeroed when a new repository starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Counter {
    TotalFiles,
    TransferredFiles,
    TotalSizeBytes,
    TransferredSizeBytes,
    Phase1Files,
    Phase1Storage,
    TotalTransferredFiles,
    TotalTransferredStorage,
    TotalDiffFiles,
    TotalDiffStorage,
    TotalUploadedDiffFiles,
    TotalUploadedDiffStorage,
    Failures,
}

const COUNTER_COUNT: usize = 13;

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::TotalFiles,
        Counter::TransferredFiles,
        Counter::TotalSizeBytes,
        Counter::TransferredSizeBytes,
        Counter::Phase1Files,
        Counter::Phase1Storage,
        Counter::TotalTransferredFiles,
        Counter::TotalTransferredStorage,
        Counter::TotalDiffFiles,
        Counter::TotalDiffStorage,
        Counter::TotalUploadedDiffFiles,
        Counter::TotalUploadedDiffStorage,
        Counter::Failures,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn bit(self) -> u32 {
        1u32 << self.index()
    }

    /// Totals are fixed once per phase (or per run) through `set_total`.
    pub fn is_total(self) -> bool {
        matches!(
            self,
            Counter::TotalFiles
                | Counter::TotalSizeBytes
                | Counter::Phase1Files
                | Counter::Phase1Storage
                | Counter::TotalDiffFiles
                | Counter::TotalDiffStorage
        )
    }

    pub fn is_repository_scoped(self) -> bool {
        !matches!(
            self,
            Counter::TotalFiles
                | Counter::TransferredFiles
                | Counter::TotalSizeBytes
                | Counter::TransferredSizeBytes
                | Counter::Failures
        )
    }
}

/// Process-local, thread-safe counter set shared by workers, the sequencer,
/// the estimator and the renderer.
///
/// Values are plain atomics. The `gate` lets many writers run `apply`
/// concurrently while `snapshot` excludes them for the duration of the copy,
/// so a snapshot never contains half of a multi-counter update.
pub struct CounterStore {
    values: [AtomicI64; COUNTER_COUNT],
    totals_set: AtomicU32,
    gate: RwLock<()>,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicI64::new(0)),
            totals_set: AtomicU32::new(0),
            gate: RwLock::new(()),
        }
    }

    pub fn get(&self, key: Counter) -> i64 {
        self.values[key.index()].load(Ordering::SeqCst)
    }

    pub fn add(&self, key: Counter, delta: i64) {
        self.apply(&[(key, delta)]);
    }

    /// Apply several deltas as one step from a snapshot reader's point of view.
    pub fn apply(&self, deltas: &[(Counter, i64)]) {
        let _guard = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        for (key, delta) in deltas {
            self.values[key.index()].fetch_add(*delta, Ordering::SeqCst);
        }
    }

    /// Fix a total. Fails with `AlreadySet` on a second call before the
    /// owning scope (repository or run) is reset.
    pub fn set_total(&self, key: Counter, value: i64) -> Result<(), StateError> {
        if !key.is_total() {
            return Err(StateError::NotATotal(key));
        }
        let prev = self.totals_set.fetch_or(key.bit(), Ordering::SeqCst);
        if prev & key.bit() != 0 {
            return Err(StateError::AlreadySet(key));
        }
        let _guard = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.values[key.index()].store(value, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_total_set(&self, key: Counter) -> bool {
        self.totals_set.load(Ordering::SeqCst) & key.bit() != 0
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let values = Counter::ALL.iter().map(|k| (*k, self.get(*k))).collect();
        CounterSnapshot { values }
    }

    /// Zero the per-repository progress counters and release their totals.
    pub fn reset_repository(&self) {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let mut mask = 0u32;
        for key in Counter::ALL.iter().filter(|k| k.is_repository_scoped()) {
            self.values[key.index()].store(0, Ordering::SeqCst);
            mask |= key.bit();
        }
        self.totals_set.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Fix a total on first use, add to it afterwards.
    pub fn grow_total(&self, key: Counter, delta: i64) -> Result<(), StateError> {
        if !key.is_total() {
            return Err(StateError::NotATotal(key));
        }
        if self.is_total_set(key) {
            self.add(key, delta);
            Ok(())
        } else {
            self.set_total(key, delta)
        }
    }

    /// Copy of the per-repository counters only, for parking a repository
    /// that another one displaces.
    pub fn repository_snapshot(&self) -> CounterSnapshot {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let values = Counter::ALL
            .iter()
            .filter(|k| k.is_repository_scoped())
            .map(|k| (*k, self.get(*k)))
            .collect();
        CounterSnapshot { values }
    }

    /// Replace the per-repository counters with a parked snapshot. Totals
    /// stay released so the resumed phase fixes them again.
    pub fn restore_repository(&self, snapshot: &CounterSnapshot) {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let mut mask = 0u32;
        for key in Counter::ALL.iter().filter(|k| k.is_repository_scoped()) {
            self.values[key.index()].store(snapshot.get(*key), Ordering::SeqCst);
            mask |= key.bit();
        }
        self.totals_set.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Load values from a persisted snapshot. Run totals present in the
    /// snapshot count as already fixed for this run.
    pub fn restore(&self, snapshot: &CounterSnapshot) {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        for key in Counter::ALL {
            self.values[key.index()].store(snapshot.get(key), Ordering::SeqCst);
            if key.is_total() && !key.is_repository_scoped() && snapshot.values.contains_key(&key)
            {
                self.totals_set.fetch_or(key.bit(), Ordering::SeqCst);
            }
        }
    }
}

/// Immutable copy of every counter, taken under the store's gate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterSnapshot {
    values: BTreeMap<Counter, i64>,
}

impl CounterSnapshot {
    pub fn get(&self, key: Counter) -> i64 {
        self.values.get(&key).copied().unwrap_or(0)
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus {
            total_files: non_negative(self.get(Counter::TotalFiles)),
            transferred_files: non_negative(self.get(Counter::TransferredFiles)),
            total_size_bytes: non_negative(self.get(Counter::TotalSizeBytes)),
            transferred_size_bytes: non_negative(self.get(Counter::TransferredSizeBytes)),
        }
    }

    pub fn progress_state(&self) -> ProgressState {
        ProgressState {
            phase1_files: non_negative(self.get(Counter::Phase1Files)),
            phase1_storage: non_negative(self.get(Counter::Phase1Storage)),
            total_transferred_files: non_negative(self.get(Counter::TotalTransferredFiles)),
            total_transferred_storage: non_negative(self.get(Counter::TotalTransferredStorage)),
            total_diff_files: non_negative(self.get(Counter::TotalDiffFiles)),
            total_diff_storage: non_negative(self.get(Counter::TotalDiffStorage)),
            total_uploaded_diff_files: non_negative(self.get(Counter::TotalUploadedDiffFiles)),
            total_uploaded_diff_storage: non_negative(
                self.get(Counter::TotalUploadedDiffStorage),
            ),
        }
    }
}

fn non_negative(v: i64) -> u64 {
    v.max(0) as u64
}

/// Run-wide totals and progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub total_files: u64,
    pub transferred_files: u64,
    pub total_size_bytes: u64,
    pub transferred_size_bytes: u64,
}

impl RunStatus {
    pub fn remaining_bytes(&self) -> u64 {
        self.total_size_bytes.saturating_sub(self.transferred_size_bytes)
    }
}

/// Progress of the repository currently being transferred.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub phase1_files: u64,
    pub phase1_storage: u64,
    pub total_transferred_files: u64,
    pub total_transferred_storage: u64,
    pub total_diff_files: u64,
    pub total_diff_storage: u64,
    pub total_uploaded_diff_files: u64,
    pub total_uploaded_diff_storage: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_total_twice_is_rejected_until_reset() {
        let store = CounterStore::new();
        store.set_total(Counter::Phase1Files, 10).expect("first set");
        let err = store.set_total(Counter::Phase1Files, 11).unwrap_err();
        assert!(matches!(err, StateError::AlreadySet(Counter::Phase1Files)));
        assert_eq!(store.get(Counter::Phase1Files), 10);

        store.reset_repository();
        assert!(!store.is_total_set(Counter::Phase1Files));
        store.set_total(Counter::Phase1Files, 4).expect("set after reset");
        assert_eq!(store.get(Counter::Phase1Files), 4);
    }

    #[test]
    fn grow_total_sets_then_adds() {
        let store = CounterStore::new();
        store.grow_total(Counter::TotalFiles, 3).unwrap();
        assert!(store.is_total_set(Counter::TotalFiles));
        store.grow_total(Counter::TotalFiles, 4).unwrap();
        assert_eq!(store.get(Counter::TotalFiles), 7);
        assert!(store.grow_total(Counter::TransferredFiles, 1).is_err());
    }

    #[test]
    fn parked_repository_counters_come_back() {
        let store = CounterStore::new();
        store.apply(&[(Counter::TransferredFiles, 4), (Counter::TotalTransferredFiles, 4)]);
        store.set_total(Counter::Phase1Files, 6).unwrap();
        let parked = store.repository_snapshot();
        assert_eq!(parked.get(Counter::TransferredFiles), 0);
        store.reset_repository();
        store.apply(&[(Counter::TransferredFiles, 2), (Counter::TotalTransferredFiles, 2)]);
        store.restore_repository(&parked);
        assert_eq!(store.get(Counter::TotalTransferredFiles), 4);
        assert_eq!(store.get(Counter::Phase1Files), 6);
        assert_eq!(store.get(Counter::TransferredFiles), 6);
        assert!(!store.is_total_set(Counter::Phase1Files));
    }

    #[test]
    fn set_total_rejects_progress_counters() {
        let store = CounterStore::new();
        let err = store.set_total(Counter::TransferredFiles, 1).unwrap_err();
        assert!(matches!(err, StateError::NotATotal(Counter::TransferredFiles)));
    }

    #[test]
    fn reset_repository_keeps_run_status() {
        let store = CounterStore::new();
        store.set_total(Counter::TotalFiles, 50).unwrap();
        store.apply(&[(Counter::TransferredFiles, 3), (Counter::TotalTransferredFiles, 3)]);
        store.add(Counter::Failures, 2);
        store.reset_repository();
        assert_eq!(store.get(Counter::TotalFiles), 50);
        assert_eq!(store.get(Counter::TransferredFiles), 3);
        assert_eq!(store.get(Counter::Failures), 2);
        assert_eq!(store.get(Counter::TotalTransferredFiles), 0);
        assert!(store.is_total_set(Counter::TotalFiles));
    }

    #[test]
    fn snapshot_never_splits_an_apply() {
        let store = Arc::new(CounterStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..20_000 {
                    store.apply(&[(Counter::TransferredFiles, 1), (Counter::TransferredSizeBytes, 10)]);
                }
            })
        };
        for _ in 0..2_000 {
            let snap = store.snapshot();
            assert_eq!(
                snap.get(Counter::TransferredFiles) * 10,
                snap.get(Counter::TransferredSizeBytes)
            );
        }
        writer.join().expect("writer");
        assert_eq!(store.get(Counter::TransferredFiles), 20_000);
    }

    #[test]
    fn restore_marks_run_totals_as_set() {
        let source = CounterStore::new();
        source.set_total(Counter::TotalSizeBytes, 1024).unwrap();
        source.add(Counter::TransferredSizeBytes, 512);
        let snap = source.snapshot();

        let target = CounterStore::new();
        target.restore(&snap);
        assert_eq!(target.get(Counter::TransferredSizeBytes), 512);
        assert!(target.set_total(Counter::TotalSizeBytes, 1).is_err());
        assert_eq!(snap.run_status().remaining_bytes(), 512);
    }

    #[test]
    fn snapshot_clamps_negative_views() {
        let store = CounterStore::new();
        store.add(Counter::TotalTransferredFiles, -3);
        assert_eq!(store.snapshot().progress_state().total_transferred_files, 0);
        assert_eq!(store.get(Counter::TotalTransferredFiles), -3);
    }
}
