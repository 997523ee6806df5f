//! Local working directories.
//!
//! Everything a run writes lives under `<base_dir>/.shelver` unless
//! overridden:
//! - `tmp/`: rendered requests and user data, one subdirectory per run
//! - `cache/`: source archives, reused across runs
//! - `log/`: one builder log per image and version
//! - `artifacts.json`: artifacts of previous runs

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::consts::{ARTIFACTS_FILE, LOCAL_DIR};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
  /// Directory relative paths in the registry (templates, archives) resolve against.
  pub base_dir: PathBuf,
  pub tmp_dir: PathBuf,
  pub cache_dir: PathBuf,
  pub log_dir: PathBuf,
  /// Keep per-run tmp directories after the run.
  pub keep_tmp: bool,
}

impl Workspace {
  pub fn new(base_dir: impl Into<PathBuf>) -> Self {
    let base_dir = base_dir.into();
    let local = base_dir.join(LOCAL_DIR);
    Self {
      tmp_dir: local.join("tmp"),
      cache_dir: local.join("cache"),
      log_dir: local.join("log"),
      base_dir,
      keep_tmp: false,
    }
  }

  pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.tmp_dir = dir.into();
    self
  }

  pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cache_dir = dir.into();
    self
  }

  pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.log_dir = dir.into();
    self
  }

  pub fn keep_tmp(mut self, keep: bool) -> Self {
    self.keep_tmp = keep;
    self
  }

  pub fn artifacts_path(&self) -> PathBuf {
    self.base_dir.join(LOCAL_DIR).join(ARTIFACTS_FILE)
  }

  /// Create the tmp, cache and log directories.
  pub fn ensure(&self) -> io::Result<()> {
    for dir in [&self.tmp_dir, &self.cache_dir, &self.log_dir] {
      std::fs::create_dir_all(dir)?;
    }
    Ok(())
  }

  /// Create a fresh tmp directory for one run. It is removed when dropped
  /// unless `keep_tmp` is set.
  pub fn run_dir(&self) -> io::Result<RunDir> {
    std::fs::create_dir_all(&self.tmp_dir)?;
    let dir = tempfile::Builder::new()
      .prefix("run-")
      .disable_cleanup(self.keep_tmp)
      .tempdir_in(&self.tmp_dir)?;
    debug!(path = %dir.path().display(), keep = self.keep_tmp, "created run directory");
    Ok(RunDir { dir })
  }
}

/// A per-run tmp directory.
#[derive(Debug)]
pub struct RunDir {
  dir: TempDir,
}

impl RunDir {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_layout_under_local_dir() {
    let ws = Workspace::new("/work");
    assert_eq!(ws.tmp_dir, PathBuf::from("/work/.shelver/tmp"));
    assert_eq!(ws.cache_dir, PathBuf::from("/work/.shelver/cache"));
    assert_eq!(ws.log_dir, PathBuf::from("/work/.shelver/log"));
    assert_eq!(ws.artifacts_path(), PathBuf::from("/work/.shelver/artifacts.json"));
  }

  #[test]
  fn overrides_apply() {
    let ws = Workspace::new("/work").with_cache_dir("/cache").with_log_dir("/logs");
    assert_eq!(ws.cache_dir, PathBuf::from("/cache"));
    assert_eq!(ws.log_dir, PathBuf::from("/logs"));
    assert_eq!(ws.tmp_dir, PathBuf::from("/work/.shelver/tmp"));
  }

  #[test]
  fn run_dir_removed_unless_kept() {
    let base = tempfile::TempDir::new().unwrap();

    let ws = Workspace::new(base.path());
    let run = ws.run_dir().unwrap();
    let path = run.path().to_path_buf();
    assert!(path.is_dir());
    drop(run);
    assert!(!path.exists());

    let ws = ws.keep_tmp(true);
    let run = ws.run_dir().unwrap();
    let path = run.path().to_path_buf();
    drop(run);
    assert!(path.is_dir());
  }
}
