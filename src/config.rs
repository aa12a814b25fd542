use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;
pub const CONFIG_FILE_NAME: &str = "config.json";

/// JSON-on-disk helpers shared by the config file and anything else that is
/// stored as a pretty-printed document.
pub trait StorageObject: Serialize + DeserializeOwned + Default {
    fn pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize to JSON")
    }

    fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        crate::state::write_atomic(path, self.pretty_json()?.as_bytes())
            .with_context(|| format!("write {}", path.display()))
    }

    /// Missing file yields the default value; malformed JSON is an error.
    fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where state.json, state.db, control files and session logs live.
    pub state_dir: PathBuf,
    pub threads: usize,
    pub max_threads: usize,
    pub refresh_interval_ms: u64,
    pub save_interval_secs: u64,
    pub estimator_window: usize,
    /// Per-unit retries inside the local engine before a unit counts as failed.
    pub max_retries: usize,
    pub version: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            threads: 3,
            max_threads: 32,
            refresh_interval_ms: 200,
            save_interval_secs: 10,
            estimator_window: crate::estimator::DEFAULT_WINDOW,
            max_retries: 3,
            version: Some(CONFIG_VERSION),
        }
    }
}

impl StorageObject for Config {}

impl Config {
    /// Load `~/.artxfer/config.json`, creating it with defaults on first use.
    pub fn init() -> Result<Self> {
        let home = dirs::home_dir().context("cannot find user's home dir")?;
        Self::load_from(&home.join(".".to_owned() + env!("CARGO_PKG_NAME")))
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            let config = Config { state_dir: dir.join("state"), ..Config::default() };
            config.save_to(&path)?;
            tracing::debug!("created default config at {}", path.display());
            return Ok(config);
        }
        let mut config = Config::read_from(&path)?;
        if config.state_dir.is_relative() {
            config.state_dir = dir.join(&config.state_dir);
        }
        Ok(config.normalized())
    }

    /// Apply a `--threads` override, keeping the pool bounds consistent.
    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        if let Some(n) = threads {
            self.threads = n;
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.max_threads = self.max_threads.max(1);
        self.threads = self.threads.clamp(1, self.max_threads);
        self.refresh_interval_ms = self.refresh_interval_ms.max(10);
        self.save_interval_secs = self.save_interval_secs.max(1);
        self
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(crate::state::STATE_FILE_NAME)
    }

    pub fn state_db(&self) -> PathBuf {
        self.state_dir.join(crate::state::STATE_DB_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}
