// Local filesystem collaborator: every top-level directory under the source
// root is a repository, copied file by file into the same-named directory
// under the target root.
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::engine::{RepositoryLister, TransferEngine, TransferUnit};
use crate::error::TransferError;
use crate::state::atomic_rename_with_retries;
use crate::util::retry_operation;

const PART_MARKER: &str = ".axf.part.";

#[derive(Clone, Debug)]
pub struct LocalFs {
    source_root: PathBuf,
    target_root: PathBuf,
    max_retries: usize,
}

impl LocalFs {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self { source_root: source_root.into(), target_root: target_root.into(), max_retries: 3 }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    fn repository_root(&self, repository: &str) -> Result<PathBuf, TransferError> {
        let root = self.source_root.join(repository);
        if !root.is_dir() {
            return Err(TransferError::SourceMissing(root.display().to_string()));
        }
        Ok(root)
    }

    fn walk<F>(&self, repository: &str, mut keep: F) -> Result<Vec<TransferUnit>, TransferError>
    where
        F: FnMut(&std::fs::Metadata) -> bool,
    {
        let root = self.repository_root(repository)?;
        let mut units = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| TransferError::Read {
                path: root.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let rel = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
            if rel.contains(PART_MARKER) {
                continue;
            }
            let md = entry.metadata().map_err(|e| TransferError::Read {
                path: entry.path().display().to_string(),
                message: e.to_string(),
            })?;
            if keep(&md) {
                units.push(TransferUnit::new(rel, md.len()));
            }
        }
        Ok(units)
    }

    fn copy_once(&self, src: &Path, dst: &Path) -> Result<u64, TransferError> {
        let write_err = |path: &Path, e: std::io::Error| TransferError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
        let file_name = dst.file_name().and_then(|s| s.to_str()).unwrap_or("unit");
        let tmp_path = parent.join(format!("{}{}{}", file_name, PART_MARKER, std::process::id()));

        let mut reader = match File::open(src) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::SourceMissing(src.display().to_string()));
            }
            Err(e) => {
                return Err(TransferError::Read { path: src.display().to_string(), message: e.to_string() });
            }
        };
        let copied = (|| -> std::io::Result<u64> {
            let mut out = File::create(&tmp_path)?;
            let n = std::io::copy(&mut reader, &mut out)?;
            out.flush()?;
            out.sync_all()?;
            Ok(n)
        })();
        let n = match copied {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(write_err(&tmp_path, e));
            }
        };
        if let Err(e) = atomic_rename_with_retries(&tmp_path, dst) {
            tracing::debug!("rename {} -> {} failed: {}", tmp_path.display(), dst.display(), e);
            let _ = std::fs::remove_file(&tmp_path);
            return Err(write_err(dst, e));
        }
        Ok(n)
    }
}

impl TransferEngine for LocalFs {
    fn transfer_unit(&self, repository: &str, unit: &TransferUnit) -> Result<u64, TransferError> {
        if !self.target_root.is_dir() {
            return Err(TransferError::TargetUnavailable(self.target_root.display().to_string()));
        }
        let src = self.source_root.join(repository).join(&unit.path);
        let dst = self.target_root.join(repository).join(&unit.path);
        retry_operation(self.max_retries, TransferError::is_retriable, || self.copy_once(&src, &dst))
    }
}

impl RepositoryLister for LocalFs {
    fn repositories(&self) -> Result<Vec<String>, TransferError> {
        let rd = std::fs::read_dir(&self.source_root)
            .map_err(|_| TransferError::SourceMissing(self.source_root.display().to_string()))?;
        let mut names: Vec<String> = rd
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn list_all(&self, repository: &str) -> Result<Vec<TransferUnit>, TransferError> {
        self.walk(repository, |_| true)
    }

    fn list_changed(
        &self,
        repository: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TransferUnit>, TransferError> {
        self.walk(repository, |md| match md.modified() {
            Ok(t) => DateTime::<Utc>::from(t) >= since,
            // no mtime support: treat as changed, a second copy is harmless
            Err(_) => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, LocalFs) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(src.join("libs/org/acme")).unwrap();
        std::fs::create_dir_all(src.join("npm")).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(src.join("libs/org/acme/a.jar"), b"aaaa").unwrap();
        std::fs::write(src.join("libs/b.pom"), b"bb").unwrap();
        std::fs::write(src.join("top-level-file"), b"ignored").unwrap();
        let fs = LocalFs::new(src, dst);
        (dir, fs)
    }

    #[test]
    fn lists_repositories_and_units() {
        let (_dir, fs) = fixture();
        assert_eq!(fs.repositories().unwrap(), vec!["libs".to_string(), "npm".to_string()]);
        let units = fs.list_all("libs").unwrap();
        assert_eq!(
            units,
            vec![TransferUnit::new("b.pom", 2), TransferUnit::new("org/acme/a.jar", 4)]
        );
        let summary = fs.summarize("libs").unwrap();
        assert_eq!((summary.files, summary.bytes), (2, 6));
        assert!(fs.list_all("npm").unwrap().is_empty());
    }

    #[test]
    fn copies_unit_atomically() {
        let (_dir, fs) = fixture();
        let n = fs.transfer_unit("libs", &TransferUnit::new("org/acme/a.jar", 4)).unwrap();
        assert_eq!(n, 4);
        let dst = fs.target_root().join("libs/org/acme/a.jar");
        assert_eq!(std::fs::read(&dst).unwrap(), b"aaaa");
        let leftovers: Vec<_> = std::fs::read_dir(dst.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(PART_MARKER))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_source_and_target_errors() {
        let (_dir, fs) = fixture();
        let err = fs.transfer_unit("libs", &TransferUnit::new("gone.jar", 1)).unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
        assert!(!err.is_fatal());

        std::fs::remove_dir_all(fs.target_root()).unwrap();
        let err = fs.transfer_unit("libs", &TransferUnit::new("b.pom", 2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn list_changed_filters_by_mtime() {
        let (_dir, fs) = fixture();
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(fs.list_changed("libs", future).unwrap().is_empty());
        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(fs.list_changed("libs", past).unwrap().len(), 2);
    }
}
