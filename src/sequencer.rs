//! Drives one repository through phase 1 (full), phase 2 (diff) and
//! phase 3 (retry), persisting its position at every boundary so an
//! interrupted run resumes where it stopped.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::engine::{RepositoryLister, RepositorySummary, TransferEngine, TransferUnit};
use crate::error::TransferError;
use crate::phase::{Phase, RepoPhaseState};
use crate::pool::{PoolReport, UnitOutcome, WorkerPool};
use crate::progress::ProgressOrchestrator;
use crate::state::{CompletedJournal, Counter, RetryLedger, RetryRecord, StateDb, StateManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepositoryOutcome {
    /// All phases ran; failures that survived phase 3 stay in the ledger.
    Completed,
    /// Finished by an earlier run with nothing left to retry.
    AlreadyDone,
    /// A graceful stop interrupted the repository; it resumes in its
    /// current phase next time.
    Stopped,
}

pub struct PhaseSequencer<'a> {
    lister: &'a dyn RepositoryLister,
    engine: &'a dyn TransferEngine,
    pool: &'a WorkerPool,
    state: &'a StateManager,
    ledger: RetryLedger,
    journal: CompletedJournal,
    progress: &'a ProgressOrchestrator,
}

impl<'a> PhaseSequencer<'a> {
    pub fn new(
        lister: &'a dyn RepositoryLister,
        engine: &'a dyn TransferEngine,
        pool: &'a WorkerPool,
        state: &'a StateManager,
        db: &StateDb,
        progress: &'a ProgressOrchestrator,
    ) -> Self {
        Self { lister, engine, pool, state, ledger: db.ledger(), journal: db.journal(), progress }
    }

    fn stop_requested(&self) -> bool {
        self.pool.stop_signal().is_requested()
    }

    // Record the new position and save; a failed save is retried by the
    // autosave thread, so it only warns here.
    fn persist(&self, repository: &str, next: RepoPhaseState) {
        self.state.update_record(repository, |r| r.state = next);
        if let Err(e) = self.state.save() {
            tracing::warn!("saving state after {} entered {} failed: {}", repository, next.label(), e);
        }
    }

    pub fn run_repository(&self, name: &str) -> Result<RepositoryOutcome> {
        let mut record = self.state.record(name);
        if record.state == RepoPhaseState::Done {
            let pending = self.ledger.count_for(name)?;
            if pending == 0 {
                tracing::debug!("{} already transferred, skipping", name);
                return Ok(RepositoryOutcome::AlreadyDone);
            }
            tracing::info!("{} has {} pending failures, retrying", name, pending);
            record.state = RepoPhaseState::Phase3Active;
            self.persist(name, record.state);
        }
        // the live per-repository counters belong to whichever repository
        // ran last; park them with it before switching
        let previous = self.state.current_repository();
        if let Some(prev) = previous.as_deref()
            && prev != name
        {
            self.state.park_repository(prev);
        }
        let counters = self.state.counters();
        if record.state == RepoPhaseState::NotStarted {
            counters.reset_repository();
        } else if previous.as_deref() != Some(name) {
            counters.reset_repository();
            if let Some(parked) = &record.parked {
                tracing::debug!("restoring parked counters of {}", name);
                counters.restore_repository(parked);
            }
        }
        self.state.set_current_repository(Some(name));
        self.progress.start_repository(name);
        match record.state.active_phase() {
            Some(phase) => tracing::info!("repository {} resuming in {}", name, phase),
            None => tracing::info!("repository {} starting", name),
        }

        let mut current = record.state;
        let mut changed: Option<Vec<TransferUnit>> = None;
        loop {
            if current != RepoPhaseState::Done && self.stop_requested() {
                return self.stopped(name);
            }
            current = match current {
                RepoPhaseState::NotStarted => {
                    let started = Utc::now();
                    self.state.update_record(name, |r| r.phase1_started_at = Some(started));
                    self.persist(name, RepoPhaseState::Phase1Active);
                    RepoPhaseState::Phase1Active
                }
                RepoPhaseState::Phase1Active => {
                    if !self.run_full(name)? {
                        return self.stopped(name);
                    }
                    let since = match self.state.record(name).phase1_started_at {
                        Some(t) => t,
                        None => {
                            // records written before the timestamp existed: take everything
                            tracing::warn!("{} has no phase 1 start time, diffing from epoch", name);
                            chrono::DateTime::<Utc>::UNIX_EPOCH
                        }
                    };
                    let diff = self
                        .lister
                        .list_changed(name, since)
                        .with_context(|| format!("list changes of {}", name))?;
                    let failures = self.ledger.count_for(name)? > 0;
                    let next = current.next(!diff.is_empty(), failures);
                    changed = Some(diff);
                    self.persist(name, next);
                    next
                }
                RepoPhaseState::Phase2Active => {
                    let units = match changed.take() {
                        Some(units) => units,
                        None => {
                            let since = self.state.record(name).phase1_started_at.unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH);
                            self.lister.list_changed(name, since).with_context(|| format!("list changes of {}", name))?
                        }
                    };
                    if !self.run_diff(name, units)? {
                        return self.stopped(name);
                    }
                    let next = current.next(false, self.ledger.count_for(name)? > 0);
                    self.persist(name, next);
                    next
                }
                RepoPhaseState::Phase3Active => {
                    if !self.run_retry(name)? {
                        return self.stopped(name);
                    }
                    let next = current.next(false, false);
                    self.persist(name, next);
                    next
                }
                RepoPhaseState::Done => break,
            };
        }

        self.journal.clear(name)?;
        self.state.update_record(name, |r| r.parked = None);
        self.state.set_current_repository(None);
        if let Err(e) = self.state.save() {
            tracing::warn!("saving state after {} finished failed: {}", name, e);
        }
        self.progress.finish_repository();
        tracing::info!("repository {} done", name);
        Ok(RepositoryOutcome::Completed)
    }

    fn stopped(&self, name: &str) -> Result<RepositoryOutcome> {
        if let Err(e) = self.state.save() {
            tracing::warn!("saving state after stop failed: {}", e);
        }
        tracing::info!("repository {} stopped at {}", name, self.state.record(name).state.label());
        Ok(RepositoryOutcome::Stopped)
    }

    // Returns whether every unit was dispatched.
    fn finish_phase(&self, name: &str, phase: Phase, id: usize, report: PoolReport) -> Result<bool> {
        tracing::info!(
            "{} {}: {} transferred, {} failed, {} skipped",
            name,
            phase,
            report.succeeded,
            report.failed,
            report.skipped
        );
        if let Some(fatal) = report.fatal {
            return Err(anyhow::Error::new(fatal).context(format!("{} of {} aborted", phase, name)));
        }
        if report.skipped > 0 {
            return Ok(false);
        }
        self.progress.done_phase(id)?;
        Ok(true)
    }

    fn run_full(&self, name: &str) -> Result<bool> {
        let units = self.lister.list_all(name).with_context(|| format!("list units of {}", name))?;
        let completed = self.journal.completed_for(name)?;
        let total_files = units.len() as i64;
        let total_bytes: u64 = units.iter().map(|u| u.size).sum();
        let (already, pending): (Vec<TransferUnit>, Vec<TransferUnit>) =
            units.into_iter().partition(|u| completed.contains(&u.path));

        let counters = self.state.counters();
        self.reconcile_run_totals(name, RepositorySummary { files: total_files as u64, bytes: total_bytes });
        // units journalled after the last save are missing from the restored counters
        let journalled_files = already.len() as i64;
        let journalled_bytes: i64 = already.iter().map(|u| u.size as i64).sum();
        let lag_files = journalled_files - counters.get(Counter::TotalTransferredFiles);
        let lag_bytes = journalled_bytes - counters.get(Counter::TotalTransferredStorage);
        if lag_files > 0 {
            tracing::debug!("{}: catching up {} journalled units", name, lag_files);
            counters.apply(&[
                (Counter::TotalTransferredFiles, lag_files),
                (Counter::TotalTransferredStorage, lag_bytes.max(0)),
                (Counter::TransferredFiles, lag_files),
                (Counter::TransferredSizeBytes, lag_bytes.max(0)),
            ]);
        }
        for (key, value) in [(Counter::Phase1Files, total_files), (Counter::Phase1Storage, total_bytes as i64)] {
            if let Err(e) = counters.set_total(key, value) {
                tracing::debug!("{}: {}", name, e);
            }
        }

        let id = self.progress.add_phase(Phase::Full, total_files as u64);
        self.progress.increment_phase_by(id, journalled_files as u64)?;
        let report = self.pool.run(self.engine, name, pending, |o| self.on_outcome(name, Phase::Full, id, o));
        self.finish_phase(name, Phase::Full, id, report)
    }

    // The run totals hold the summary taken when the repository was first
    // selected; bring them in line with what phase 1 actually lists.
    fn reconcile_run_totals(&self, name: &str, listed: RepositorySummary) {
        let counted = self.state.record(name).counted.unwrap_or_default();
        let files = listed.files as i64 - counted.files as i64;
        let bytes = listed.bytes as i64 - counted.bytes as i64;
        if files != 0 || bytes != 0 {
            tracing::debug!("{}: run totals off by {} files, {} bytes", name, files, bytes);
            let counters = self.state.counters();
            for (key, delta) in [(Counter::TotalFiles, files), (Counter::TotalSizeBytes, bytes)] {
                if let Err(e) = counters.grow_total(key, delta) {
                    tracing::debug!("{}: {}", name, e);
                }
            }
        }
        self.state.update_record(name, |r| r.counted = Some(listed));
    }

    fn run_diff(&self, name: &str, units: Vec<TransferUnit>) -> Result<bool> {
        let files = units.len() as i64;
        let bytes: i64 = units.iter().map(|u| u.size as i64).sum();
        let counters = self.state.counters();
        // drop what an interrupted attempt of this phase contributed; the
        // diff is recomputed and sent again as a whole
        let prev_files = counters.get(Counter::TotalDiffFiles);
        let prev_bytes = counters.get(Counter::TotalDiffStorage);
        let prev_up_files = counters.get(Counter::TotalUploadedDiffFiles);
        let prev_up_bytes = counters.get(Counter::TotalUploadedDiffStorage);
        counters.apply(&[
            (Counter::TotalFiles, files - prev_files),
            (Counter::TotalSizeBytes, bytes - prev_bytes),
            (Counter::TransferredFiles, -prev_up_files),
            (Counter::TransferredSizeBytes, -prev_up_bytes),
            (Counter::TotalUploadedDiffFiles, -prev_up_files),
            (Counter::TotalUploadedDiffStorage, -prev_up_bytes),
        ]);
        for (key, value) in [(Counter::TotalDiffFiles, files), (Counter::TotalDiffStorage, bytes)] {
            if let Err(e) = counters.set_total(key, value) {
                tracing::debug!("{}: {}", name, e);
            }
        }

        let id = self.progress.add_phase(Phase::Diff, files as u64);
        let report = self.pool.run(self.engine, name, units, |o| self.on_outcome(name, Phase::Diff, id, o));
        self.finish_phase(name, Phase::Diff, id, report)
    }

    fn run_retry(&self, name: &str) -> Result<bool> {
        let records = self.ledger.list_for(name)?;
        let units: Vec<TransferUnit> = records.into_iter().map(|r| TransferUnit::new(r.path, 0)).collect();
        let id = self.progress.add_phase(Phase::Retry, units.len() as u64);
        let report = self.pool.run(self.engine, name, units, |o| self.on_outcome(name, Phase::Retry, id, o));
        self.finish_phase(name, Phase::Retry, id, report)
    }

    fn on_outcome(&self, name: &str, phase: Phase, id: usize, outcome: UnitOutcome) {
        let UnitOutcome { unit, result } = outcome;
        match result {
            Ok(bytes) => self.record_success(name, phase, &unit, bytes),
            Err(e) => self.record_failure(name, phase, &unit, &e),
        }
        if let Err(e) = self.progress.increment_phase(id) {
            tracing::warn!("progress update for {} failed: {}", unit.path, e);
        }
    }

    fn record_success(&self, name: &str, phase: Phase, unit: &TransferUnit, bytes: u64) {
        let b = bytes as i64;
        let mut deltas = vec![(Counter::TransferredFiles, 1), (Counter::TransferredSizeBytes, b)];
        match phase {
            Phase::Full => {
                if let Err(e) = self.journal.mark(name, &unit.path) {
                    tracing::warn!("journal write for {}/{} failed: {}", name, unit.path, e);
                }
                deltas.extend([(Counter::TotalTransferredFiles, 1), (Counter::TotalTransferredStorage, b)]);
            }
            Phase::Diff => {
                deltas.extend([(Counter::TotalUploadedDiffFiles, 1), (Counter::TotalUploadedDiffStorage, b)]);
            }
            Phase::Retry => {}
        }
        let cleared = match self.ledger.remove(name, &unit.path) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!("retry ledger delete for {}/{} failed: {}", name, unit.path, e);
                false
            }
        };
        if cleared {
            deltas.push((Counter::Failures, -1));
        }
        self.state.counters().apply(&deltas);
        if cleared {
            self.progress.adjust_failure_count(-1);
        }
    }

    fn record_failure(&self, name: &str, phase: Phase, unit: &TransferUnit, err: &TransferError) {
        tracing::debug!("{} {} failed for {}: {}", name, phase, unit.path, err);
        let known = match self.ledger.contains(name, &unit.path) {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!("retry ledger lookup for {}/{} failed: {}", name, unit.path, e);
                false
            }
        };
        if let Err(e) = self.ledger.append(&RetryRecord::new(name, &unit.path, err.reason())) {
            tracing::warn!("retry ledger write for {}/{} failed: {}", name, unit.path, e);
            return;
        }
        if !known {
            self.state.counters().add(Counter::Failures, 1);
            self.progress.adjust_failure_count(1);
        }
    }
}
