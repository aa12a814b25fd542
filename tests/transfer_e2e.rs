use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use artxfer::commands::{RunOptions, TransferSummary, run_transfer};
use artxfer::config::Config;
use artxfer::control::ControlDir;
use artxfer::engine::{RepositoryLister, TransferEngine, TransferUnit};
use artxfer::local::LocalFs;
use artxfer::phase::RepoPhaseState;
use artxfer::progress::{HeadlessRenderer, MemoryRenderer};
use artxfer::state::{StateDb, StateManager};
use artxfer::TransferError;

// Builds `<root>/source/<repo>/...` with `files` small files per repository.
fn make_source(root: &Path, repos: &[(&str, usize)]) -> PathBuf {
    let source = root.join("source");
    for (repo, files) in repos {
        for i in 0..*files {
            let p = source.join(repo).join(format!("org/pkg{}/artifact-{}.jar", i % 3, i));
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, format!("{}-{}", repo, i).repeat(10)).unwrap();
        }
    }
    source
}

fn make_config(root: &Path) -> Config {
    Config {
        state_dir: root.join("state"),
        threads: 1,
        refresh_interval_ms: 10,
        save_interval_secs: 1,
        ..Config::default()
    }
}

fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir).into_iter().flatten().filter(|e| e.file_type().is_file()).count()
}

fn run(config: &Config, fs: &LocalFs, engine: &dyn TransferEngine) -> anyhow::Result<TransferSummary> {
    run_transfer(config, &RunOptions::default(), fs, engine, Arc::new(HeadlessRenderer::new()), None)
}

/// Counts calls and lets a hook decide the outcome before delegating.
struct Wrapped<'a, H: Fn(usize) -> Option<TransferError> + Send + Sync> {
    inner: &'a LocalFs,
    calls: AtomicUsize,
    hook: H,
}

impl<'a, H: Fn(usize) -> Option<TransferError> + Send + Sync> Wrapped<'a, H> {
    fn new(inner: &'a LocalFs, hook: H) -> Self {
        Self { inner, calls: AtomicUsize::new(0), hook }
    }
}

impl<H: Fn(usize) -> Option<TransferError> + Send + Sync> TransferEngine for Wrapped<'_, H> {
    fn transfer_unit(&self, repository: &str, unit: &TransferUnit) -> Result<u64, TransferError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = (self.hook)(n) {
            return Err(e);
        }
        self.inner.transfer_unit(repository, unit)
    }
}

#[test]
fn full_run_copies_everything_and_rerun_is_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 5), ("npm-local", 3)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);

    let summary = run(&config, &fs, &fs).expect("first run");
    assert_eq!(summary.repositories, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.files, 8);
    assert!(!summary.stopped);
    assert_eq!(summary.pending_failures, 0);
    assert_eq!(count_files(&target), 8);
    assert_eq!(
        std::fs::read_to_string(target.join("npm-local/org/pkg1/artifact-1.jar")).unwrap(),
        "npm-local-1".repeat(10)
    );

    let doc = StateManager::load(&config.state_file()).unwrap().expect("state saved");
    assert!(doc.repositories.values().all(|r| r.state == RepoPhaseState::Done));
    assert!(doc.current_repository.is_none());
    assert!(ControlDir::new(&config.state_dir).running_pid().is_none());

    let again = run(&config, &fs, &fs).expect("second run");
    assert_eq!(again.files, 0);
    assert_eq!(again.completed, 2);
}

#[test]
fn interrupted_run_resumes_without_resending() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 6)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);

    // the target goes away after three units
    let failing = Wrapped::new(&fs, |n| (n >= 3).then(|| TransferError::TargetUnavailable("gone".into())));
    let err = run(&config, &fs, &failing).expect_err("fatal error must abort the run");
    assert!(format!("{:#}", err).contains("target repository unavailable"));
    assert_eq!(count_files(&target), 3);

    let doc = StateManager::load(&config.state_file()).unwrap().expect("state saved on teardown");
    assert_eq!(doc.repositories["libs-release"].state, RepoPhaseState::Phase1Active);
    assert_eq!(doc.current_repository.as_deref(), Some("libs-release"));

    let healthy = Wrapped::new(&fs, |_| None);
    let summary = run(&config, &fs, &healthy).expect("resumed run");
    assert_eq!(healthy.calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending_failures, 0);
    assert_eq!(count_files(&target), 6);

    let db = StateDb::open(&config.state_db()).unwrap();
    assert_eq!(db.ledger().count_all().unwrap(), 0);
    assert!(db.journal().completed_for("libs-release").unwrap().is_empty());
}

#[test]
fn stop_marker_stops_and_next_run_finishes() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 20), ("npm-local", 2)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);
    let control = ControlDir::new(&config.state_dir);

    let stopping = Wrapped::new(&fs, |n| {
        if n == 2 {
            control.request_stop().unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        None
    });
    let summary = run(&config, &fs, &stopping).expect("stopped run");
    assert!(summary.stopped);
    assert!(summary.files < 20);
    assert!(count_files(&target) < 22);
    let doc = StateManager::load(&config.state_file()).unwrap().unwrap();
    assert_eq!(doc.repositories["libs-release"].state, RepoPhaseState::Phase1Active);
    assert_eq!(doc.repositories["npm-local"].state, RepoPhaseState::NotStarted);

    let summary = run(&config, &fs, &fs).expect("resumed run");
    assert!(!summary.stopped);
    assert_eq!(summary.completed, 2);
    assert_eq!(count_files(&target), 22);
}

fn run_status(config: &Config) -> (u64, u64) {
    let doc = StateManager::load(&config.state_file()).unwrap().expect("state saved");
    let status = doc.counters.run_status();
    (status.transferred_files, status.total_files)
}

#[test]
fn resume_after_other_repository_ran_counts_each_file_once() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("a-repo", 6), ("b-repo", 2)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);
    let control = ControlDir::new(&config.state_dir);

    let stopping = Wrapped::new(&fs, |n| {
        if n == 1 {
            control.request_stop().unwrap();
        }
        std::thread::sleep(Duration::from_millis(40));
        None
    });
    let summary = run(&config, &fs, &stopping).expect("stopped run");
    assert!(summary.stopped);
    let (done_a, total) = run_status(&config);
    assert_eq!(total, 8);
    assert!(done_a < 6);

    let only_b = RunOptions { exclude_repos: vec!["a-repo".to_string()], ..RunOptions::default() };
    let summary =
        run_transfer(&config, &only_b, &fs, &fs, Arc::new(HeadlessRenderer::new()), None).unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(run_status(&config), (done_a + 2, 8));

    let summary = run(&config, &fs, &fs).expect("final run");
    assert_eq!(summary.files, 6 - done_a);
    assert_eq!(run_status(&config), (8, 8));
    assert_eq!(count_files(&target), 8);
}

#[test]
fn new_repository_grows_run_totals() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("a-repo", 3)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);

    run(&config, &fs, &fs).expect("first run");
    assert_eq!(run_status(&config), (3, 3));

    make_source(tmp.path(), &[("b-repo", 4)]);
    let summary = run(&config, &fs, &fs).expect("second run");
    assert_eq!(summary.files, 4);
    assert_eq!(run_status(&config), (7, 7));
}

#[test]
fn excluded_repository_joins_totals_when_selected_later() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("a-repo", 2), ("b-repo", 5)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);

    let only_a = RunOptions { include_repos: vec!["a-repo".to_string()], ..RunOptions::default() };
    run_transfer(&config, &only_a, &fs, &fs, Arc::new(HeadlessRenderer::new()), None).unwrap();
    assert_eq!(run_status(&config), (2, 2));

    run(&config, &fs, &fs).expect("all repositories");
    assert_eq!(run_status(&config), (7, 7));
}

#[test]
fn failures_are_retried_on_next_run() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 4)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);

    // the first unit fails in phase 1 and again in phase 3
    let flaky = Wrapped::new(&fs, |n| {
        (n == 0 || n == 4).then(|| TransferError::Other("checksum mismatch".into()))
    });
    let summary = run(&config, &fs, &flaky).expect("run with failures");
    assert_eq!(summary.pending_failures, 1);
    assert_eq!(count_files(&target), 3);
    let doc = StateManager::load(&config.state_file()).unwrap().unwrap();
    assert_eq!(doc.repositories["libs-release"].state, RepoPhaseState::Done);

    let summary = run(&config, &fs, &fs).expect("retry run");
    assert_eq!(summary.pending_failures, 0);
    assert_eq!(summary.files, 1);
    assert_eq!(count_files(&target), 4);
}

#[test]
fn include_and_exclude_patterns_select_repositories() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 1), ("libs-snapshot", 1), ("npm-local", 1)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);
    let opts = RunOptions {
        include_repos: vec!["libs-*".to_string()],
        exclude_repos: vec!["*snapshot".to_string()],
        ..RunOptions::default()
    };
    let summary =
        run_transfer(&config, &opts, &fs, &fs, Arc::new(HeadlessRenderer::new()), None).unwrap();
    assert_eq!(summary.repositories, 1);
    assert!(target.join("libs-release").is_dir());
    assert!(!target.join("libs-snapshot").exists());
    assert!(!target.join("npm-local").exists());
}

#[test]
fn missing_display_falls_back_to_headless() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 2)]);
    let target = tmp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let config = make_config(tmp.path());
    let fs = LocalFs::new(&source, &target);
    let renderer = Arc::new(MemoryRenderer::unavailable());
    let summary =
        run_transfer(&config, &RunOptions::default(), &fs, &fs, renderer.clone(), None).unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(renderer.created(), 0);
}

#[test]
fn lister_sees_only_finished_files() {
    let tmp = tempfile::tempdir().unwrap();
    let source = make_source(tmp.path(), &[("libs-release", 2)]);
    // a partial copy left by a crashed transfer is not a unit
    std::fs::write(source.join("libs-release/org/pkg0/artifact-0.jar.axf.part.42"), "half").unwrap();
    let fs = LocalFs::new(&source, tmp.path().join("target"));
    let units = fs.list_all("libs-release").unwrap();
    assert_eq!(units.len(), 2);
    let future: DateTime<Utc> = Utc::now() + chrono::Duration::hours(1);
    assert!(fs.list_changed("libs-release", future).unwrap().is_empty());
}
