use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use serde::Serialize;

use crate::config::Config;
use crate::control::{ControlDir, StopSignal};
use crate::engine::{RepositoryLister, TransferEngine};
use crate::local::LocalFs;
use crate::logging::SessionLog;
use crate::phase::RepoPhaseState;
use crate::pool::WorkerPool;
use crate::progress::{HeadlessRenderer, IndicatifRenderer, ProgressOptions, ProgressOrchestrator, Renderer};
use crate::sequencer::{PhaseSequencer, RepositoryOutcome};
use crate::state::{Counter, CounterStore, StateDb, StateManager};
use crate::util::{human_bytes, print_summary, select_repositories};

/// Split a `;`-separated pattern list, dropping empty entries.
pub fn parse_patterns(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split(';').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[derive(Clone, Debug)]
pub struct TransferArgs {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub threads: Option<usize>,
    pub run: RunOptions,
    pub json: bool,
    pub quiet: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub ignore_state: bool,
    pub include_repos: Vec<String>,
    pub exclude_repos: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TransferSummary {
    pub repositories: usize,
    pub completed: u64,
    pub stopped: bool,
    pub files: u64,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub pending_failures: u64,
    pub log_path: Option<String>,
}

pub fn handle_transfer(config: &Config, args: TransferArgs, session_log: Option<SessionLog>) -> Result<()> {
    let config = config.clone().with_threads(args.threads);
    if !args.source_root.is_dir() {
        anyhow::bail!("source root {} is not a directory", args.source_root.display());
    }
    std::fs::create_dir_all(&args.target_root)
        .with_context(|| format!("create target root {}", args.target_root.display()))?;
    let fs = LocalFs::new(&args.source_root, &args.target_root).with_max_retries(config.max_retries);
    let renderer: Arc<dyn Renderer> = if args.quiet || args.json {
        Arc::new(HeadlessRenderer::new())
    } else {
        Arc::new(IndicatifRenderer::new())
    };
    let summary = run_transfer(&config, &args.run, &fs, &fs, renderer, session_log)?;

    if !args.quiet {
        print_summary(summary.bytes, summary.elapsed_secs, summary.files, summary.pending_failures);
        if summary.stopped {
            println!("🛑 Transfer stopped; run the same command again to resume.");
        } else if summary.pending_failures > 0 {
            println!("⚠️ {} files failed and will be retried on the next run.", summary.pending_failures);
        } else {
            println!("✅ {} of {} repositories transferred", summary.completed, summary.repositories);
        }
        if let Some(p) = &summary.log_path {
            println!("Session log: {}", p);
        }
    }
    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}

/// Run a whole transfer: select repositories, restore state, drive every
/// repository through its phases and tear down. The run's own error wins
/// over teardown errors, which are only logged in that case.
pub fn run_transfer(
    config: &Config,
    opts: &RunOptions,
    lister: &dyn RepositoryLister,
    engine: &dyn TransferEngine,
    renderer: Arc<dyn Renderer>,
    session_log: Option<SessionLog>,
) -> Result<TransferSummary> {
    let start = Instant::now();
    let all = lister.repositories().context("list repositories")?;
    let selected = select_repositories(&all, &opts.include_repos, &opts.exclude_repos);
    if selected.is_empty() {
        tracing::warn!("no repository matched the include/exclude patterns");
        if let Some(log) = session_log {
            log.close()?;
        }
        return Ok(TransferSummary::default());
    }

    let control = ControlDir::new(&config.state_dir);
    if let Some(pid) = control.running_pid() {
        tracing::warn!("state directory claims a running transfer (pid {}), taking over", pid);
    }
    control.begin_run()?;
    let _running = RunMarker(&control);

    let db = if opts.ignore_state {
        StateDb::open_fresh(&config.state_db())
    } else {
        StateDb::open(&config.state_db())
    }
    .with_context(|| format!("open {}", config.state_db().display()))?;
    let counters = Arc::new(CounterStore::new());
    let state = Arc::new(
        StateManager::open(config.state_file(), counters.clone(), opts.ignore_state)
            .with_context(|| format!("open {}", config.state_file().display()))?,
    );
    if opts.ignore_state
        && let Some(archived) = state.archive()?
    {
        tracing::info!("previous state archived to {}", archived.display());
    }

    let ledger = db.ledger();
    let pending = |name: &String| state.record(name).state != RepoPhaseState::Done;
    // repositories enter the run totals once, the first time they are selected
    let (mut files, mut bytes) = (0u64, 0u64);
    for name in selected.iter().filter(|n| pending(*n) && state.record(n).counted.is_none()) {
        let s = lister.summarize(name).with_context(|| format!("summarize {}", name))?;
        files += s.files;
        bytes += s.bytes;
        state.update_record(name, |r| r.counted = Some(s));
    }
    counters.grow_total(Counter::TotalFiles, files as i64)?;
    counters.grow_total(Counter::TotalSizeBytes, bytes as i64)?;
    let ledger_failures = ledger.count_over(selected.iter())? as i64;
    counters.add(Counter::Failures, ledger_failures - counters.get(Counter::Failures));
    let mut completed = 0u64;
    for name in selected.iter().filter(|n| !pending(*n)) {
        if ledger.count_for(name)? == 0 {
            completed += 1;
        }
    }
    let baseline = counters.snapshot().run_status();

    let pool = WorkerPool::new(config.threads, config.max_threads, StopSignal::new());
    let options = ProgressOptions {
        ignore_state: opts.ignore_state,
        refresh_interval: Duration::from_millis(config.refresh_interval_ms),
        estimator_window: config.estimator_window,
        worker_count: pool.size(),
        completed,
    };
    let progress = match ProgressOrchestrator::init(renderer, &selected, counters.clone(), &ledger, options.clone()) {
        Ok(p) => p,
        Err(e) if e.is_retryable() => {
            tracing::debug!("{}; falling back to log output", e);
            ProgressOrchestrator::init(Arc::new(HeadlessRenderer::new()), &selected, counters.clone(), &ledger, options)?
        }
        Err(e) => return Err(e.into()),
    };
    let progress = Arc::new(progress);
    let log_path = session_log.as_ref().map(|l| l.path().display().to_string());
    if let Some(log) = session_log {
        progress.attach_session_log(log);
    }

    let autosave = state.spawn_autosave(Duration::from_secs(config.save_interval_secs));
    let watcher = {
        let (stop, on_stop_progress) = (pool.stop_signal().clone(), Arc::clone(&progress));
        let (sizer, on_threads_progress) = (pool.clone(), Arc::clone(&progress));
        control.spawn_watcher(
            Duration::from_millis(config.refresh_interval_ms),
            move || {
                stop.request();
                on_stop_progress.stop_gracefully();
            },
            move |n| {
                let applied = sizer.set_size(n);
                on_threads_progress.set_worker_count(applied);
            },
        )
    };

    let sequencer = PhaseSequencer::new(lister, engine, &pool, &state, &db, &progress);
    let mut run_result: Result<()> = Ok(());
    let mut stopped = false;
    for name in &selected {
        match sequencer.run_repository(name) {
            Ok(RepositoryOutcome::Stopped) => {
                stopped = true;
                break;
            }
            Ok(RepositoryOutcome::Completed) => completed += 1,
            Ok(RepositoryOutcome::AlreadyDone) => {}
            Err(e) => {
                tracing::error!("transfer of {} failed: {:#}", name, e);
                run_result = Err(e.context(format!("transfer of repository {}", name)));
                break;
            }
        }
    }
    stopped |= pool.stop_signal().is_requested();

    watcher.stop();
    autosave.stop();

    // summarized before quit so the line still lands in the session log
    let status = counters.snapshot().run_status();
    let pending_failures = ledger.count_over(selected.iter());
    let summary = TransferSummary {
        repositories: selected.len(),
        completed: completed.min(selected.len() as u64),
        stopped,
        files: status.transferred_files.saturating_sub(baseline.transferred_files),
        bytes: status.transferred_size_bytes.saturating_sub(baseline.transferred_size_bytes),
        elapsed_secs: start.elapsed().as_secs_f64(),
        pending_failures: pending_failures.as_ref().copied().unwrap_or(0),
        log_path,
    };
    tracing::info!(
        "run finished: {} files, {}, {} pending failures, stopped={}",
        summary.files,
        human_bytes(summary.bytes),
        summary.pending_failures,
        summary.stopped
    );
    let teardown = progress.quit();
    let run_result = run_result.and(pending_failures.map(|_| ()).context("count pending failures"));
    match (run_result, teardown) {
        (Err(e), Err(t)) => {
            tracing::warn!("progress teardown failed after run error: {}", t);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(t)) => Err(t).context("progress teardown"),
        (Ok(()), Ok(())) => Ok(summary),
    }
}

/// Clears the running marker however the run ends.
struct RunMarker<'a>(&'a ControlDir);

impl Drop for RunMarker<'_> {
    fn drop(&mut self) {
        self.0.end_run();
    }
}

fn when(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn handle_status(config: &Config, json: bool) -> Result<()> {
    let Some(doc) = StateManager::load(&config.state_file())? else {
        println!("No transfer state in {}", config.state_dir.display());
        return Ok(());
    };
    let failures = if config.state_db().exists() {
        StateDb::open(&config.state_db())?.ledger().repositories()?
    } else {
        Vec::new()
    };
    if json {
        let obj = serde_json::json!({
            "state": doc,
            "pending_failures": failures.iter().map(|(r, n)| serde_json::json!({"repository": r, "count": n})).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }
    let status = doc.counters.run_status();
    println!(
        "Files: {}/{}    Storage: {}/{}    Saved: {}",
        status.transferred_files,
        status.total_files,
        human_bytes(status.transferred_size_bytes),
        human_bytes(status.total_size_bytes),
        doc.saved_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    );
    if let Some(current) = &doc.current_repository {
        println!("Current repository: {}", current);
    }
    let title = vec![
        "Repository".cell().bold(true),
        "Phase".cell().bold(true),
        "Phase 1 Started".cell().bold(true),
        "Updated".cell().bold(true),
        "Pending Failures".cell().bold(true),
    ];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    for (name, record) in &doc.repositories {
        let pending = failures.iter().find(|(r, _)| r == name).map(|(_, n)| *n).unwrap_or(0);
        table.push(vec![
            name.cell(),
            record.state.label().cell(),
            when(record.phase1_started_at).cell().justify(Justify::Right),
            when(record.updated_at).cell().justify(Justify::Right),
            pending.cell().justify(Justify::Right),
        ]);
    }
    if !table.is_empty() {
        print_stdout(table.table().title(title)).context("print status table")?;
    }
    Ok(())
}

pub fn handle_stop(config: &Config) -> Result<()> {
    let control = ControlDir::new(&config.state_dir);
    let Some(pid) = control.running_pid() else {
        eprintln!("No running transfer found in {}", config.state_dir.display());
        return Ok(());
    };
    control.request_stop()?;
    println!("🛑 Asked transfer (pid {}) to stop gracefully", pid);
    Ok(())
}

pub fn handle_threads(config: &Config, count: usize) -> Result<()> {
    if count == 0 || count > config.max_threads {
        anyhow::bail!("thread count must be between 1 and {}", config.max_threads);
    }
    let control = ControlDir::new(&config.state_dir);
    let Some(pid) = control.running_pid() else {
        eprintln!("No running transfer found in {}", config.state_dir.display());
        return Ok(());
    };
    control.request_threads(count)?;
    println!("✅ Asked transfer (pid {}) to use {} threads", pid, count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_are_split_and_trimmed() {
        assert_eq!(parse_patterns(Some("a; b*;;")), vec!["a".to_string(), "b*".to_string()]);
        assert!(parse_patterns(None).is_empty());
    }

    #[test]
    fn threads_request_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { state_dir: dir.path().to_path_buf(), max_threads: 4, ..Config::default() };
        assert!(handle_threads(&config, 0).is_err());
        assert!(handle_threads(&config, 5).is_err());
        // nothing running: accepted but nothing written
        handle_threads(&config, 2).unwrap();
        assert!(!dir.path().join("threads").exists());
    }
}
