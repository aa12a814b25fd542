// Bounded worker pool: a producer feeds units through a bounded channel to
// scoped worker threads; the live size can change while a batch runs.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::control::StopSignal;
use crate::engine::{TransferEngine, TransferUnit};
use crate::error::TransferError;

/// Result of one dispatched unit.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: TransferUnit,
    pub result: Result<u64, TransferError>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PoolReport {
    pub succeeded: u64,
    pub failed: u64,
    /// Units never handed to the engine because of a stop or a fatal error.
    pub skipped: u64,
    pub bytes: u64,
    pub fatal: Option<TransferError>,
}

impl PoolReport {
    pub fn dispatched(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Debug)]
struct PoolSize {
    size: Mutex<usize>,
    changed: Condvar,
}

#[derive(Clone, Debug)]
pub struct WorkerPool {
    max_threads: usize,
    size: Arc<PoolSize>,
    stop: StopSignal,
}

impl WorkerPool {
    pub fn new(size: usize, max_threads: usize, stop: StopSignal) -> Self {
        let max_threads = max_threads.max(1);
        let size = size.clamp(1, max_threads);
        Self {
            max_threads,
            size: Arc::new(PoolSize { size: Mutex::new(size), changed: Condvar::new() }),
            stop,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn size(&self) -> usize {
        *self.size.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the number of active workers; returns the size actually applied.
    pub fn set_size(&self, n: usize) -> usize {
        let applied = n.clamp(1, self.max_threads);
        let mut guard = self.size.size.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard != applied {
            tracing::debug!("worker pool size {} -> {}", *guard, applied);
        }
        *guard = applied;
        self.size.changed.notify_all();
        applied
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    // Park worker `index` while it is outside the live size. Returns false
    // once the batch is over and the worker should exit.
    fn wait_for_slot(&self, index: usize, producer_done: &AtomicBool) -> bool {
        let mut guard = self.size.size.lock().unwrap_or_else(PoisonError::into_inner);
        while index >= *guard {
            if producer_done.load(Ordering::SeqCst) || self.stop.is_requested() {
                return false;
            }
            let (g, _) = self
                .size
                .changed
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
        true
    }

    /// Transfer `units` of `repository`, calling `on_outcome` exactly once for
    /// every unit handed to the engine. Blocks until in-flight units finish.
    pub fn run<E, F>(
        &self,
        engine: &E,
        repository: &str,
        units: Vec<TransferUnit>,
        on_outcome: F,
    ) -> PoolReport
    where
        E: TransferEngine + ?Sized,
        F: Fn(UnitOutcome) + Sync,
    {
        if units.is_empty() {
            return PoolReport::default();
        }
        let cap = std::cmp::max(4, self.max_threads * 4);
        let (tx, rx) = bounded::<TransferUnit>(cap);
        let producer_done = AtomicBool::new(false);
        let halted = AtomicBool::new(false);
        let fatal: Mutex<Option<TransferError>> = Mutex::new(None);
        let succeeded = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let skipped = AtomicU64::new(0);
        let bytes = AtomicU64::new(0);
        let workers = self.max_threads.min(units.len());

        std::thread::scope(|s| {
            for index in 0..workers {
                let rx = rx.clone();
                let (producer_done, halted, fatal) = (&producer_done, &halted, &fatal);
                let (succeeded, failed, skipped, bytes) = (&succeeded, &failed, &skipped, &bytes);
                let on_outcome = &on_outcome;
                s.spawn(move || {
                    loop {
                        if !self.wait_for_slot(index, producer_done) {
                            // leave remaining units to active workers; count them if stopping
                            if self.stop.is_requested() || halted.load(Ordering::SeqCst) {
                                while rx.try_recv().is_ok() {
                                    skipped.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            break;
                        }
                        let Ok(unit) = rx.recv() else { break };
                        if self.stop.is_requested() || halted.load(Ordering::SeqCst) {
                            skipped.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        let result = engine.transfer_unit(repository, &unit);
                        match &result {
                            Ok(n) => {
                                succeeded.fetch_add(1, Ordering::SeqCst);
                                bytes.fetch_add(*n, Ordering::SeqCst);
                            }
                            Err(e) => {
                                failed.fetch_add(1, Ordering::SeqCst);
                                tracing::debug!("[pool] worker_id={} {}/{} failed: {}", index, repository, unit.path, e);
                                if e.is_fatal() && !halted.swap(true, Ordering::SeqCst) {
                                    tracing::warn!("fatal transfer error, stopping dispatch: {}", e);
                                    *fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.clone());
                                }
                            }
                        }
                        on_outcome(UnitOutcome { unit, result });
                    }
                });
            }
            drop(rx);

            let mut iter = units.into_iter();
            for unit in iter.by_ref() {
                if self.stop.is_requested() || halted.load(Ordering::SeqCst) {
                    skipped.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                // blocking send applies backpressure on the producer
                if tx.send(unit).is_err() {
                    skipped.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
            skipped.fetch_add(iter.count() as u64, Ordering::SeqCst);
            drop(tx);
            producer_done.store(true, Ordering::SeqCst);
            self.size.changed.notify_all();
        });

        PoolReport {
            succeeded: succeeded.into_inner(),
            failed: failed.into_inner(),
            skipped: skipped.into_inner(),
            bytes: bytes.into_inner(),
            fatal: fatal.into_inner().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct Recording {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_every: usize,
        stop_after: Option<(usize, StopSignal)>,
        fatal: bool,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_every: 0,
                stop_after: None,
                fatal: false,
            }
        }
    }

    impl TransferEngine for Recording {
        fn transfer_unit(&self, _repository: &str, unit: &TransferUnit) -> Result<u64, TransferError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some((n, signal)) = &self.stop_after
                && call == *n
            {
                signal.request();
            }
            if self.fatal {
                return Err(TransferError::TargetUnavailable("gone".into()));
            }
            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(TransferError::Other(format!("boom {}", unit.path)));
            }
            Ok(unit.size)
        }
    }

    fn units(n: usize) -> Vec<TransferUnit> {
        (0..n).map(|i| TransferUnit::new(format!("u{:03}", i), 10)).collect()
    }

    #[test]
    fn every_unit_gets_exactly_one_outcome() {
        let pool = WorkerPool::new(4, 4, StopSignal::new());
        let engine = Recording { fail_every: 5, ..Recording::new() };
        let seen = Mutex::new(Vec::new());
        let report = pool.run(&engine, "repo", units(50), |o| seen.lock().unwrap().push(o.unit.path));
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 50);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 50);
        assert_eq!(report.succeeded, 40);
        assert_eq!(report.failed, 10);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.bytes, 400);
        assert!(report.fatal.is_none());
    }

    #[test]
    fn live_size_bounds_concurrency() {
        let pool = WorkerPool::new(1, 8, StopSignal::new());
        let engine = Recording::new();
        let report = pool.run(&engine, "repo", units(20), |_| {});
        assert_eq!(report.succeeded, 20);
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_size_is_clamped() {
        let pool = WorkerPool::new(3, 32, StopSignal::new());
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.set_size(64), 32);
        assert_eq!(pool.set_size(0), 1);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn stop_skips_undispatched_units() {
        let signal = StopSignal::new();
        let pool = WorkerPool::new(1, 1, signal.clone());
        let engine = Recording { stop_after: Some((3, signal.clone())), ..Recording::new() };
        let outcomes = AtomicUsize::new(0);
        let report = pool.run(&engine, "repo", units(10), |_| {
            outcomes.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(outcomes.load(Ordering::SeqCst), 3);
        assert_eq!(report.dispatched(), 3);
        assert_eq!(report.skipped, 7);
    }

    #[test]
    fn fatal_error_halts_dispatch() {
        let pool = WorkerPool::new(1, 1, StopSignal::new());
        let engine = Recording { fatal: true, ..Recording::new() };
        let report = pool.run(&engine, "repo", units(5), |_| {});
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 4);
        assert!(matches!(report.fatal, Some(TransferError::TargetUnavailable(_))));
    }
}
