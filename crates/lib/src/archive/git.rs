//! Reading tracked content out of a git commit.

use std::path::Path;

use gix::object::tree::EntryKind;
use tracing::debug;

use super::ArchiveError;
use super::tarball::{Contents, EntryData, SourceEntry};

pub(crate) fn open(dir: &Path) -> Result<gix::Repository, ArchiveError> {
  gix::open(dir).map_err(|e| ArchiveError::SourceNotFound {
    path: dir.to_path_buf(),
    reason: format!("not a git repository: {e}"),
  })
}

/// Resolve `rev` (commit, tag, branch, `HEAD`) to a commit id.
pub(crate) fn resolve_commit(repo: &gix::Repository, rev: &str) -> Result<gix::ObjectId, ArchiveError> {
  let revision_err = |message: String| ArchiveError::Revision {
    rev: rev.to_string(),
    message,
  };

  let spec = repo.rev_parse(rev).map_err(|e| revision_err(e.to_string()))?;
  let id = spec
    .single()
    .ok_or_else(|| revision_err("revision is ambiguous".to_string()))?;
  let commit = id
    .object()
    .map_err(|e| revision_err(e.to_string()))?
    .peel_to_commit()
    .map_err(|e| revision_err(e.to_string()))?;

  Ok(commit.id)
}

/// Every blob and symlink in the commit's tree. Submodules are skipped.
pub(crate) fn commit_entries(repo: &gix::Repository, commit: gix::ObjectId) -> Result<Vec<SourceEntry>, ArchiveError> {
  let git_err = |message: String| ArchiveError::Git {
    path: repo.path().to_path_buf(),
    message,
  };

  let tree = repo
    .find_commit(commit)
    .map_err(|e| git_err(e.to_string()))?
    .tree()
    .map_err(|e| git_err(e.to_string()))?;

  let mut recorder = gix::traverse::tree::Recorder::default();
  tree
    .traverse()
    .breadthfirst(&mut recorder)
    .map_err(|e| git_err(e.to_string()))?;

  let mut entries = Vec::new();
  for record in recorder.records {
    let path = record.filepath.to_string();
    let kind = record.mode.kind();
    let data = match kind {
      EntryKind::Tree => continue,
      EntryKind::Commit => {
        debug!(path, "skipping submodule");
        continue;
      }
      EntryKind::Blob | EntryKind::BlobExecutable | EntryKind::Link => {
        let object = repo.find_object(record.oid).map_err(|e| git_err(e.to_string()))?;
        let bytes = object.detach().data;
        if kind == EntryKind::Link {
          EntryData::Symlink(String::from_utf8_lossy(&bytes).into_owned())
        } else {
          EntryData::File {
            contents: Contents::Bytes(bytes),
            executable: kind == EntryKind::BlobExecutable,
          }
        }
      }
    };
    entries.push(SourceEntry { path, data });
  }
  Ok(entries)
}
