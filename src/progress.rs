//! Live progress display of a transfer run.
//!
//! The [`ProgressOrchestrator`] is created per run and shared by reference
//! between the sequencer and the worker threads. It owns a tree of
//! rendering handles: run-wide bars (repositories, storage, metrics) and
//! the active repository's subtree (headline and one node per phase).
//! A refresh thread reads counter snapshots at a fixed interval to drive
//! storage, speed and ETA widgets; it never writes domain state.

pub mod render;
pub mod tree;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded, select, tick};

use crate::error::ProgressError;
use crate::estimator::{DEFAULT_WINDOW, ThroughputEstimator};
use crate::logging::SessionLog;
use crate::phase::Phase;
use crate::state::{CounterSnapshot, CounterStore, RetryLedger};

pub use render::{
    HeadlessRenderer, IndicatifRenderer, MemoryRenderer, Renderer, WidgetId, WidgetKind, WidgetState,
};
pub use tree::BarNode;

pub const REPOSITORIES_HEADLINE: &str = "Transferring your repositories";
pub const REPOSITORY_PREFIX: &str = "Current repository: ";
pub const WORKING_THREADS: &str = "Working threads: ";
pub const TRANSFER_SPEEDS: &str = "Transfer speeds: ";
pub const TIME_REMAINING: &str = "Time remainings: ";
pub const TRANSFER_FAILURES: &str = "Transfer failures: ";
pub const FAILURE_NOTE: &str =
    "Note: In Phase 3 and in subsequent executions, we'll retry transferring the failed files.";
pub const STOP_LINE: &str = "🛑 Gracefully stopping files transfer";

#[derive(Debug, Clone)]
pub struct ProgressOptions {
    /// Start the failure display at zero instead of the ledger's count.
    pub ignore_state: bool,
    pub refresh_interval: Duration,
    pub estimator_window: usize,
    pub worker_count: usize,
    /// Repositories already finished by an earlier run.
    pub completed: u64,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            ignore_state: false,
            refresh_interval: Duration::from_millis(200),
            estimator_window: DEFAULT_WINDOW,
            worker_count: 0,
            completed: 0,
        }
    }
}

#[derive(Debug)]
struct PhaseTracker {
    phase: Phase,
    total: u64,
    done: u64,
    finished: bool,
    headline: WidgetId,
    storage: Option<WidgetId>,
    files: Option<WidgetId>,
}

/// The active repository: its name, phase trackers and rendering subtree.
#[derive(Debug)]
struct RepositoryRun {
    name: String,
    node: BarNode,
    phases: Vec<PhaseTracker>,
}

struct RunWidgets {
    repositories: BarNode,
    storage: BarNode,
    files: WidgetId,
}

struct MetricWidgets {
    threads: BarNode,
    speed: BarNode,
    eta: BarNode,
    failures: BarNode,
    note: BarNode,
}

impl MetricWidgets {
    fn close(self, renderer: &dyn Renderer) {
        self.threads.close(renderer);
        self.speed.close(renderer);
        self.eta.close(renderer);
        self.failures.close(renderer);
        self.note.close(renderer);
    }
}

struct Inner {
    displaying: bool,
    closed: bool,
    total_repositories: u64,
    completed_repositories: u64,
    failures: u64,
    workers: usize,
    run: Option<RunWidgets>,
    metrics: Option<MetricWidgets>,
    repository: Option<RepositoryRun>,
    stop_line: Option<BarNode>,
    estimator: ThroughputEstimator,
}

struct Refresher {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ProgressOrchestrator {
    renderer: Arc<dyn Renderer>,
    counters: Arc<CounterStore>,
    inner: Arc<Mutex<Inner>>,
    refresher: Mutex<Option<Refresher>>,
    session_log: Mutex<Option<SessionLog>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProgressOrchestrator {
    /// Create every run-level widget and start the refresh thread.
    ///
    /// Fails with a retryable [`ProgressError::Init`] before touching the
    /// renderer when it reports no display, and with
    /// [`ProgressError::Ledger`] when the failure count cannot be seeded.
    pub fn init(
        renderer: Arc<dyn Renderer>,
        repositories: &[String],
        counters: Arc<CounterStore>,
        ledger: &RetryLedger,
        options: ProgressOptions,
    ) -> Result<Self, ProgressError> {
        if !renderer.is_available() {
            return Err(ProgressError::Init("no terminal available for progress display".into()));
        }
        let failures = if options.ignore_state { 0 } else { ledger.count_over(repositories.iter())? };
        let total_repositories = repositories.len() as u64;
        let completed = options.completed.min(total_repositories);

        let r = renderer.as_ref();
        let repos = r.create(WidgetKind::Tasks, REPOSITORIES_HEADLINE);
        r.set_total(repos, total_repositories);
        r.set_position(repos, completed);
        r.set_message(repos, "Repositories");

        let mut storage = BarNode::new(r.create(WidgetKind::Bytes, "Storage"));
        let files = storage.push(BarNode::new(r.create(WidgetKind::Tasks, "Files")));

        let metrics = MetricWidgets {
            threads: BarNode::new(r.create(WidgetKind::Value, WORKING_THREADS)),
            speed: BarNode::new(r.create(WidgetKind::Value, TRANSFER_SPEEDS)),
            eta: BarNode::new(r.create(WidgetKind::Value, TIME_REMAINING)),
            failures: BarNode::new(r.create(WidgetKind::Value, TRANSFER_FAILURES)),
            note: BarNode::new(r.create(WidgetKind::Headline, "")),
        };

        let inner = Inner {
            displaying: true,
            closed: false,
            total_repositories,
            completed_repositories: completed,
            failures,
            workers: options.worker_count,
            run: Some(RunWidgets { repositories: BarNode::new(repos), storage, files }),
            metrics: Some(metrics),
            repository: None,
            stop_line: None,
            estimator: ThroughputEstimator::new(options.estimator_window),
        };
        let inner = Arc::new(Mutex::new(inner));
        {
            let mut guard = lock(&inner);
            render_failures(&guard, r);
            render_workers(&guard, r);
            refresh_locked(&mut guard, r, &counters.snapshot());
        }
        tracing::debug!(
            "progress initialised: {} repositories, {} already done, {} pending failures",
            total_repositories,
            completed,
            failures
        );

        let refresher = spawn_refresher(
            Arc::clone(&inner),
            Arc::clone(&renderer),
            Arc::clone(&counters),
            options.refresh_interval,
        );
        Ok(Self {
            renderer,
            counters,
            inner,
            refresher: Mutex::new(Some(refresher)),
            session_log: Mutex::new(None),
        })
    }

    /// Hand over the auxiliary session log; `quit` closes it.
    pub fn attach_session_log(&self, log: SessionLog) {
        *lock(&self.session_log) = Some(log);
    }

    /// Finalize the active repository (if any) and show `name` as current.
    pub fn start_repository(&self, name: &str) {
        let mut inner = lock(&self.inner);
        let r = self.renderer.as_ref();
        finish_repository_locked(&mut inner, r);
        if !inner.displaying {
            return;
        }
        let headline = r.create(WidgetKind::Spinner, &format!("{}{}", REPOSITORY_PREFIX, name));
        inner.repository =
            Some(RepositoryRun { name: name.to_string(), node: BarNode::new(headline), phases: Vec::new() });
    }

    pub fn current_repository(&self) -> Option<String> {
        lock(&self.inner).repository.as_ref().map(|run| run.name.clone())
    }

    /// Register a phase tracker for the active repository and return its id.
    /// A zero total renders the phase as already complete.
    pub fn add_phase(&self, phase: Phase, total: u64) -> usize {
        let mut inner = lock(&self.inner);
        let r = self.renderer.as_ref();
        let displaying = inner.displaying;
        let Some(run) = inner.repository.as_mut() else {
            tracing::debug!("add_phase({}) without an active repository", phase);
            return 0;
        };
        let id = run.phases.len();
        if !displaying {
            return id;
        }
        let mut node = BarNode::new(r.create(WidgetKind::Headline, phase.headline()));
        let headline = node.widget();
        let (storage_label, files_label) = phase.labels();
        let storage = match phase {
            Phase::Full | Phase::Diff if total > 0 => {
                Some(node.push(BarNode::new(r.create(WidgetKind::Bytes, storage_label))))
            }
            _ => None,
        };
        let files = if total > 0 {
            let files = node.push(BarNode::new(r.create(WidgetKind::Tasks, files_label)));
            r.set_total(files, total);
            Some(files)
        } else {
            r.set_message(headline, " (nothing to transfer)");
            r.finish(headline);
            None
        };
        run.node.push(node);
        run.phases.push(PhaseTracker { phase, total, done: 0, finished: total == 0, headline, storage, files });
        id
    }

    pub fn increment_phase(&self, id: usize) -> Result<(), ProgressError> {
        self.advance("increment_phase", id, 1)
    }

    /// Advance phase `id` by `n` units. Overshooting the phase total marks
    /// the phase done instead of counting past it.
    pub fn increment_phase_by(&self, id: usize, n: u64) -> Result<(), ProgressError> {
        self.advance("increment_phase_by", id, n)
    }

    fn advance(&self, op: &'static str, id: usize, n: u64) -> Result<(), ProgressError> {
        let mut inner = lock(&self.inner);
        let r = self.renderer.as_ref();
        let Some(tracker) = tracker_mut(&mut inner, op, id)? else {
            return Ok(());
        };
        if tracker.total == 0 || tracker.finished {
            if tracker.finished && tracker.total > 0 && n > 0 {
                tracing::debug!("{}: phase {} already done, ignoring +{}", op, tracker.phase, n);
            }
            return Ok(());
        }
        if tracker.done + n > tracker.total {
            tracing::debug!(
                "{}: {} at {}/{} advanced by {}, clamping to done",
                op,
                tracker.phase,
                tracker.done,
                tracker.total,
                n
            );
            complete_phase(tracker, r);
            return Ok(());
        }
        tracker.done += n;
        if let Some(files) = tracker.files {
            r.set_position(files, tracker.done);
        }
        if tracker.done == tracker.total {
            complete_phase(tracker, r);
        }
        Ok(())
    }

    /// Mark phase `id` complete. Calling it again changes nothing.
    pub fn done_phase(&self, id: usize) -> Result<(), ProgressError> {
        let mut inner = lock(&self.inner);
        let r = self.renderer.as_ref();
        if let Some(tracker) = tracker_mut(&mut inner, "done_phase", id)?
            && !tracker.finished
        {
            complete_phase(tracker, r);
        }
        Ok(())
    }

    /// Count the active repository as completed and release its widgets.
    pub fn finish_repository(&self) {
        let mut inner = lock(&self.inner);
        finish_repository_locked(&mut inner, self.renderer.as_ref());
    }

    pub fn completed_repositories(&self) -> u64 {
        lock(&self.inner).completed_repositories
    }

    /// Apply a signed change to the displayed failure count, never going
    /// below zero. The retry ledger stays the authority.
    pub fn adjust_failure_count(&self, delta: i64) {
        let mut inner = lock(&self.inner);
        let next = inner.failures as i64 + delta;
        if next < 0 {
            tracing::debug!("failure display would drop to {}, clamping at 0", next);
        }
        inner.failures = next.max(0) as u64;
        render_failures(&inner, self.renderer.as_ref());
    }

    pub fn failure_count(&self) -> u64 {
        lock(&self.inner).failures
    }

    pub fn set_worker_count(&self, n: usize) {
        let mut inner = lock(&self.inner);
        inner.workers = n;
        render_workers(&inner, self.renderer.as_ref());
    }

    /// Sample the counters and redraw the counter-driven widgets now.
    pub fn refresh(&self) {
        let snapshot = self.counters.snapshot();
        let mut inner = lock(&self.inner);
        refresh_locked(&mut inner, self.renderer.as_ref(), &snapshot);
    }

    pub fn is_displaying(&self) -> bool {
        lock(&self.inner).displaying
    }

    /// Stop showing progress and display the stopping indicator. Further
    /// increments are ignored. Safe to call more than once.
    pub fn stop_gracefully(&self) {
        let mut inner = lock(&self.inner);
        if !inner.displaying || inner.closed {
            return;
        }
        inner.displaying = false;
        let r = self.renderer.as_ref();
        if let Some(metrics) = inner.metrics.take() {
            metrics.close(r);
        }
        finish_repository_locked(&mut inner, r);
        if let Some(run) = inner.run.take() {
            run.repositories.close(r);
            run.storage.close(r);
        }
        inner.stop_line = Some(BarNode::new(r.create(WidgetKind::Spinner, STOP_LINE)));
        tracing::info!("graceful stop requested");
    }

    /// Tear everything down: join the refresh thread, close every widget,
    /// wait for the renderer to drain, then close the session log.
    pub fn quit(&self) -> Result<(), ProgressError> {
        self.stop_refresher();
        {
            let mut inner = lock(&self.inner);
            if !inner.closed {
                inner.closed = true;
                inner.displaying = false;
                let r = self.renderer.as_ref();
                if let Some(metrics) = inner.metrics.take() {
                    metrics.close(r);
                }
                finish_repository_locked(&mut inner, r);
                if let Some(run) = inner.run.take() {
                    run.repositories.close(r);
                    run.storage.close(r);
                }
                if let Some(line) = inner.stop_line.take() {
                    line.close(r);
                }
            }
        }
        self.renderer.wait_idle();
        match lock(&self.session_log).take() {
            Some(log) => log.close(),
            None => Ok(()),
        }
    }

    fn stop_refresher(&self) {
        if let Some(Refresher { stop_tx, handle }) = lock(&self.refresher).take() {
            drop(stop_tx);
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressOrchestrator {
    fn drop(&mut self) {
        self.stop_refresher();
    }
}

fn tracker_mut<'a>(
    inner: &'a mut Inner,
    op: &'static str,
    id: usize,
) -> Result<Option<&'a mut PhaseTracker>, ProgressError> {
    let Some(run) = inner.repository.as_mut() else {
        return Ok(None);
    };
    let registered = run.phases.len();
    if registered == 0 {
        // released by a stop or a finished repository
        return Ok(None);
    }
    match run.phases.get_mut(id) {
        Some(t) => Ok(Some(t)),
        None => Err(ProgressError::InvalidPhaseIndex { op, id, registered }),
    }
}

fn complete_phase(tracker: &mut PhaseTracker, r: &dyn Renderer) {
    tracker.done = tracker.total;
    tracker.finished = true;
    if let Some(files) = tracker.files {
        r.set_position(files, tracker.total);
        r.finish(files);
    }
    if let Some(storage) = tracker.storage {
        r.finish(storage);
    }
    r.finish(tracker.headline);
}

fn finish_repository_locked(inner: &mut Inner, r: &dyn Renderer) {
    let Some(run) = inner.repository.take() else {
        return;
    };
    inner.completed_repositories = (inner.completed_repositories + 1).min(inner.total_repositories.max(1));
    if let Some(widgets) = &inner.run {
        r.set_position(widgets.repositories.widget(), inner.completed_repositories);
    }
    tracing::debug!("repository {} released ({} phases)", run.name, run.phases.len());
    run.node.close(r);
}

fn render_failures(inner: &Inner, r: &dyn Renderer) {
    if let Some(m) = &inner.metrics {
        r.set_message(m.failures.widget(), &inner.failures.to_string());
        r.set_message(m.note.widget(), if inner.failures > 0 { FAILURE_NOTE } else { "" });
    }
}

fn render_workers(inner: &Inner, r: &dyn Renderer) {
    if let Some(m) = &inner.metrics {
        r.set_message(m.threads.widget(), &inner.workers.to_string());
    }
}

fn refresh_locked(inner: &mut Inner, r: &dyn Renderer, snapshot: &CounterSnapshot) {
    if !inner.displaying {
        return;
    }
    let status = snapshot.run_status();
    inner.estimator.sample(&status);
    if let Some(run) = &inner.run {
        r.set_total(run.storage.widget(), status.total_size_bytes);
        r.set_position(run.storage.widget(), status.transferred_size_bytes.min(status.total_size_bytes));
        r.set_total(run.files, status.total_files);
        r.set_position(run.files, status.transferred_files.min(status.total_files));
    }
    if let Some(m) = &inner.metrics {
        r.set_message(m.speed.widget(), &inner.estimator.speed_string());
        r.set_message(m.eta.widget(), &inner.estimator.eta_string());
    }
    let progress = snapshot.progress_state();
    if let Some(repo) = &inner.repository {
        for tracker in &repo.phases {
            let Some(storage) = tracker.storage else { continue };
            if tracker.finished {
                continue;
            }
            let (total, done) = match tracker.phase {
                Phase::Full => (progress.phase1_storage, progress.total_transferred_storage),
                Phase::Diff => (progress.total_diff_storage, progress.total_uploaded_diff_storage),
                Phase::Retry => continue,
            };
            r.set_total(storage, total);
            r.set_position(storage, done.min(total));
        }
    }
}

fn spawn_refresher(
    inner: Arc<Mutex<Inner>>,
    renderer: Arc<dyn Renderer>,
    counters: Arc<CounterStore>,
    interval: Duration,
) -> Refresher {
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let handle = std::thread::spawn(move || {
        let ticker = tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let snapshot = counters.snapshot();
                    let mut guard = lock(&inner);
                    refresh_locked(&mut guard, renderer.as_ref(), &snapshot);
                }
                recv(stop_rx) -> _ => break,
            }
        }
    });
    Refresher { stop_tx, handle }
}
