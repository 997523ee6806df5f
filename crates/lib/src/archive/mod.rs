//! Source archives for provisioning.
//!
//! An image's `archive` names a source tree that is packed into a `tar.gz`
//! and handed to the builder. Archives are content addressed inside
//! `<cache_dir>/archives`:
//!
//! - `git`: `<dir>-<commit>.tar.gz`, the tracked content of a commit
//! - `dir`: `<dir>-<hash>.tar.gz`, every regular file under the directory
//!
//! An existing archive is reused as is. Writing happens under a file lock so
//! concurrent runs sharing a cache do not race, and [`ArchiveCache`] makes
//! sure one run packs each archive at most once.

mod dir;
mod git;
mod lock;
mod tarball;

use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub use lock::CacheLock;

use crate::consts::{ARCHIVE_HASH_PREFIX_LEN, LOCAL_DIR};
use crate::registry::{ArchiveKind, ArchiveSpec};
use crate::util::hash::hash_directory;

const EXCLUDED: &[&str] = &[".git", LOCAL_DIR];

/// Errors from producing an archive. Cloneable so one failure can be
/// reported to every image sharing the archive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
  #[error("archive source {path} not usable: {reason}")]
  SourceNotFound { path: PathBuf, reason: String },

  #[error("cannot resolve revision '{rev}': {message}")]
  Revision { rev: String, message: String },

  #[error("failed to read git repository {path}: {message}")]
  Git { path: PathBuf, message: String },

  #[error("archive I/O error at {path}: {message}")]
  Io { path: PathBuf, message: String },
}

impl ArchiveError {
  fn io(path: &Path, err: impl std::fmt::Display) -> Self {
    ArchiveError::Io {
      path: path.to_path_buf(),
      message: err.to_string(),
    }
  }
}

/// A packed source archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Archive {
  pub path: PathBuf,
  pub kind: ArchiveKind,
  pub source_dir: PathBuf,
  /// The requested revision, for `git` archives.
  pub revision: Option<String>,
  /// The resolved commit id, for `git` archives.
  pub commit: Option<String>,
}

/// Pack `spec` into the cache, or return the cached archive.
///
/// `spec.dir` is resolved against `base_dir`. Blocking: call from a blocking
/// context.
pub fn materialize(spec: &ArchiveSpec, base_dir: &Path, cache_dir: &Path) -> Result<Archive, ArchiveError> {
  let requested = base_dir.join(&spec.dir);
  let source_dir = dunce::canonicalize(&requested).map_err(|e| ArchiveError::SourceNotFound {
    path: requested.clone(),
    reason: e.to_string(),
  })?;
  if !source_dir.is_dir() {
    return Err(ArchiveError::SourceNotFound {
      path: source_dir,
      reason: "not a directory".to_string(),
    });
  }

  let stem = source_dir
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "root".to_string());
  let archives_dir = cache_dir.join("archives");

  match spec.kind {
    ArchiveKind::Git => {
      let revision = spec.revision.clone().unwrap_or_else(|| "HEAD".to_string());
      let repo = git::open(&source_dir)?;
      let commit = git::resolve_commit(&repo, &revision)?;
      let path = archives_dir.join(format!("{stem}-{commit}.tar.gz"));
      write_cached(&archives_dir, &path, || git::commit_entries(&repo, commit))?;

      Ok(Archive {
        path,
        kind: spec.kind,
        source_dir,
        revision: Some(revision),
        commit: Some(commit.to_string()),
      })
    }
    ArchiveKind::Dir => {
      let hash = hash_directory(&source_dir, EXCLUDED).map_err(|e| ArchiveError::io(&source_dir, e))?;
      let path = archives_dir.join(format!("{stem}-{}.tar.gz", hash.short(ARCHIVE_HASH_PREFIX_LEN)));
      write_cached(&archives_dir, &path, || dir::dir_entries(&source_dir, EXCLUDED))?;

      Ok(Archive {
        path,
        kind: spec.kind,
        source_dir,
        revision: None,
        commit: None,
      })
    }
  }
}

fn write_cached<F>(dir: &Path, path: &Path, entries: F) -> Result<(), ArchiveError>
where
  F: FnOnce() -> Result<Vec<tarball::SourceEntry>, ArchiveError>,
{
  let _lock = CacheLock::acquire(dir, "archive").map_err(|e| ArchiveError::io(dir, e))?;

  if path.is_file() {
    debug!(path = %path.display(), "reusing cached archive");
    return Ok(());
  }

  let entries = entries()?;
  let count = entries.len();

  let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ArchiveError::io(dir, e))?;
  let mut writer = tarball::write(entries, BufWriter::new(&mut tmp)).map_err(|e| ArchiveError::io(path, e))?;
  writer.flush().map_err(|e| ArchiveError::io(path, e))?;
  drop(writer);
  tmp.persist(path).map_err(|e| ArchiveError::io(path, e.error))?;

  info!(path = %path.display(), entries = count, "created archive");
  Ok(())
}

type Slot = Arc<OnceCell<Result<Archive, ArchiveError>>>;

/// Per-run archive deduplication: each distinct spec is packed once, and
/// every caller for that spec sees the same result.
pub struct ArchiveCache {
  base_dir: PathBuf,
  cache_dir: PathBuf,
  slots: Mutex<HashMap<ArchiveSpec, Slot>>,
}

impl ArchiveCache {
  pub fn new(base_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
    Self {
      base_dir: base_dir.into(),
      cache_dir: cache_dir.into(),
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub async fn get(&self, spec: &ArchiveSpec) -> Result<Archive, ArchiveError> {
    let slot = {
      let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
      slots.entry(spec.clone()).or_default().clone()
    };

    slot
      .get_or_init(|| async {
        let spec = spec.clone();
        let base_dir = self.base_dir.clone();
        let cache_dir = self.cache_dir.clone();
        tokio::task::spawn_blocking(move || materialize(&spec, &base_dir, &cache_dir))
          .await
          .unwrap_or_else(|e| Err(ArchiveError::io(&self.cache_dir, e)))
      })
      .await
      .clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::fs;

  use flate2::read::GzDecoder;
  use tempfile::TempDir;

  use crate::util::testutil::{git, git_available};

  fn dir_spec(dir: &str) -> ArchiveSpec {
    ArchiveSpec {
      kind: ArchiveKind::Dir,
      dir: PathBuf::from(dir),
      revision: None,
    }
  }

  fn git_spec(dir: &str, revision: Option<&str>) -> ArchiveSpec {
    ArchiveSpec {
      kind: ArchiveKind::Git,
      dir: PathBuf::from(dir),
      revision: revision.map(str::to_string),
    }
  }

  fn member_names(path: &Path) -> Vec<String> {
    let file = fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
      .entries()
      .unwrap()
      .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
      .collect()
  }

  fn ansible_tree(base: &Path) {
    fs::create_dir_all(base.join("ansible/roles/base")).unwrap();
    fs::write(base.join("ansible/site.yml"), "- hosts: all\n").unwrap();
    fs::write(base.join("ansible/roles/base/main.yml"), "---\n").unwrap();
  }

  // ==========================================================================
  // Plain directories
  // ==========================================================================

  #[test]
  fn dir_archive_contains_sorted_files() {
    let base = TempDir::new().unwrap();
    ansible_tree(base.path());
    fs::create_dir_all(base.path().join("ansible/.shelver/cache")).unwrap();
    fs::write(base.path().join("ansible/.shelver/cache/junk"), "x").unwrap();

    let cache = base.path().join("cache");
    let archive = materialize(&dir_spec("ansible"), base.path(), &cache).unwrap();

    assert_eq!(archive.kind, ArchiveKind::Dir);
    assert_eq!(archive.commit, None);
    assert!(archive.path.starts_with(cache.join("archives")));
    let name = archive.path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("ansible-") && name.ends_with(".tar.gz"), "{name}");
    assert_eq!(member_names(&archive.path), vec!["roles/base/main.yml", "site.yml"]);
  }

  #[test]
  fn dir_archive_is_reproducible() {
    let base = TempDir::new().unwrap();
    ansible_tree(base.path());

    let first = materialize(&dir_spec("ansible"), base.path(), &base.path().join("c1")).unwrap();
    let second = materialize(&dir_spec("ansible"), base.path(), &base.path().join("c2")).unwrap();

    assert_eq!(first.path.file_name(), second.path.file_name());
    assert_eq!(fs::read(&first.path).unwrap(), fs::read(&second.path).unwrap());
  }

  #[test]
  fn existing_archive_is_reused() {
    let base = TempDir::new().unwrap();
    ansible_tree(base.path());
    let cache = base.path().join("cache");

    let first = materialize(&dir_spec("ansible"), base.path(), &cache).unwrap();
    fs::write(&first.path, "sentinel").unwrap();
    let second = materialize(&dir_spec("ansible"), base.path(), &cache).unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(fs::read_to_string(&second.path).unwrap(), "sentinel");
  }

  #[test]
  fn changed_content_new_archive() {
    let base = TempDir::new().unwrap();
    ansible_tree(base.path());
    let cache = base.path().join("cache");

    let first = materialize(&dir_spec("ansible"), base.path(), &cache).unwrap();
    fs::write(base.path().join("ansible/site.yml"), "- hosts: none\n").unwrap();
    let second = materialize(&dir_spec("ansible"), base.path(), &cache).unwrap();
    assert_ne!(first.path, second.path);
  }

  #[test]
  fn missing_source_dir() {
    let base = TempDir::new().unwrap();
    let result = materialize(&dir_spec("nope"), base.path(), &base.path().join("cache"));
    assert!(matches!(result, Err(ArchiveError::SourceNotFound { .. })));
  }

  // ==========================================================================
  // Git
  // ==========================================================================

  fn git_repo(base: &Path) -> Option<String> {
    if !git_available() {
      return None;
    }
    ansible_tree(base);
    let repo = base.join("ansible");
    git(&repo, &["init", "-q"]);
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "initial"]);
    Some(git(&repo, &["rev-parse", "HEAD"]))
  }

  #[test]
  fn git_archive_uses_commit_id() {
    let base = TempDir::new().unwrap();
    let Some(head) = git_repo(base.path()) else {
      return;
    };
    fs::write(base.path().join("ansible/untracked.yml"), "x").unwrap();

    let cache = base.path().join("cache");
    let archive = materialize(&git_spec("ansible", None), base.path(), &cache).unwrap();

    assert_eq!(archive.commit.as_deref(), Some(head.as_str()));
    assert_eq!(archive.revision.as_deref(), Some("HEAD"));
    assert_eq!(archive.path, cache.join("archives").join(format!("ansible-{head}.tar.gz")));
    assert_eq!(member_names(&archive.path), vec!["roles/base/main.yml", "site.yml"]);
  }

  #[test]
  fn git_archive_of_older_revision() {
    let base = TempDir::new().unwrap();
    let Some(first) = git_repo(base.path()) else {
      return;
    };
    let repo = base.path().join("ansible");
    fs::write(repo.join("extra.yml"), "---\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "second"]);
    git(&repo, &["tag", "v2"]);

    let cache = base.path().join("cache");
    let old = materialize(&git_spec("ansible", Some(&first)), base.path(), &cache).unwrap();
    let new = materialize(&git_spec("ansible", Some("v2")), base.path(), &cache).unwrap();

    assert_eq!(old.commit.as_deref(), Some(first.as_str()));
    assert!(!member_names(&old.path).contains(&"extra.yml".to_string()));
    assert!(member_names(&new.path).contains(&"extra.yml".to_string()));
  }

  #[test]
  fn git_unknown_revision() {
    let base = TempDir::new().unwrap();
    if git_repo(base.path()).is_none() {
      return;
    }
    let result = materialize(&git_spec("ansible", Some("no-such-tag")), base.path(), &base.path().join("c"));
    assert!(matches!(result, Err(ArchiveError::Revision { rev, .. }) if rev == "no-such-tag"));
  }

  #[test]
  fn git_kind_requires_repository() {
    let base = TempDir::new().unwrap();
    ansible_tree(base.path());
    let result = materialize(&git_spec("ansible", None), base.path(), &base.path().join("c"));
    assert!(matches!(result, Err(ArchiveError::SourceNotFound { .. })));
  }

  // ==========================================================================
  // Cache
  // ==========================================================================

  #[tokio::test]
  async fn cache_shares_one_result_per_spec() {
    let base = TempDir::new().unwrap();
    ansible_tree(base.path());
    let cache = Arc::new(ArchiveCache::new(base.path(), base.path().join("cache")));

    let spec = dir_spec("ansible");
    let (a, b) = tokio::join!(cache.get(&spec), cache.get(&spec));
    assert_eq!(a.unwrap(), b.unwrap());

    let missing = dir_spec("missing");
    let first = cache.get(&missing).await.unwrap_err();
    let second = cache.get(&missing).await.unwrap_err();
    assert_eq!(first, second);
  }
}
