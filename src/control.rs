// Run control: cooperative stop flag plus the files other `axf` invocations
// use to reach a running transfer (stop marker, live thread count).
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, bounded, select, tick};

const STOP_MARKER: &str = "stop";
const THREADS_FILE: &str = "threads";
const RUNNING_FILE: &str = "running.pid";

/// Shared cooperative stop flag. Producers check it before handing out
/// more work; in-flight units are never interrupted.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct ControlDir {
    dir: PathBuf,
}

impl ControlDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Forget requests left over by an earlier run and record our pid.
    pub fn begin_run(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        for name in [STOP_MARKER, THREADS_FILE] {
            let _ = std::fs::remove_file(self.file(name));
        }
        crate::state::write_atomic(&self.file(RUNNING_FILE), std::process::id().to_string().as_bytes())
            .context("write running marker")?;
        Ok(())
    }

    pub fn end_run(&self) {
        for name in [STOP_MARKER, THREADS_FILE, RUNNING_FILE] {
            let _ = std::fs::remove_file(self.file(name));
        }
    }

    /// Pid of the transfer currently holding the state directory.
    pub fn running_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.file(RUNNING_FILE)).ok()?.trim().parse().ok()
    }

    pub fn request_stop(&self) -> Result<()> {
        let stamp = chrono::Utc::now().to_rfc3339();
        crate::state::write_atomic(&self.file(STOP_MARKER), stamp.as_bytes()).context("write stop marker")
    }

    pub fn stop_requested(&self) -> bool {
        self.file(STOP_MARKER).exists()
    }

    pub fn request_threads(&self, n: usize) -> Result<()> {
        crate::state::write_atomic(&self.file(THREADS_FILE), n.to_string().as_bytes())
            .context("write threads request")
    }

    /// Consume a pending thread-count request.
    pub fn take_threads(&self) -> Option<usize> {
        let path = self.file(THREADS_FILE);
        let text = std::fs::read_to_string(&path).ok()?;
        let _ = std::fs::remove_file(&path);
        match text.trim().parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                tracing::warn!("ignoring malformed thread request {:?}", text.trim());
                None
            }
        }
    }

    /// Poll the control files every `interval`. `on_stop` fires at most once.
    pub fn spawn_watcher<S, T>(&self, interval: Duration, on_stop: S, on_threads: T) -> ControlWatcher
    where
        S: Fn() + Send + 'static,
        T: Fn(usize) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let control = self.clone();
        let handle = std::thread::spawn(move || {
            let ticker = tick(interval);
            let mut stopped = false;
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if !stopped && control.stop_requested() {
                            tracing::info!("stop requested through {}", control.file(STOP_MARKER).display());
                            stopped = true;
                            on_stop();
                        }
                        if let Some(n) = control.take_threads() {
                            tracing::info!("thread count change requested: {}", n);
                            on_threads(n);
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        ControlWatcher { stop_tx: Some(stop_tx), handle: Some(handle) }
    }
}

pub struct ControlWatcher {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlWatcher {
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

impl Drop for ControlWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
