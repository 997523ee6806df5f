//! Content hashing for cache keys.
//!
//! - `hash_directory()`: deterministic hash of a source tree
//! - `hash_file()`: single file hashing
//! - `hash_bytes()`: arbitrary byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A full 64-character SHA-256 hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Leading `len` characters, for file names.
  pub fn short(&self, len: usize) -> &str {
    &self.0[..len.min(self.0.len())]
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Hash a directory tree.
///
/// Covers relative paths, file contents, the executable bit and symlink
/// targets, but not timestamps or ownership: two checkouts of the same
/// content hash equal. Entries whose file name is in `exclude` are skipped
/// together with everything below them.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let line = if file_type.is_file() {
      let mode = if is_executable(&entry) { "x" } else { "-" };
      format!("F:{rel_path}:{mode}:{}", hash_file(entry_path)?)
    } else if file_type.is_dir() {
      format!("D:{rel_path}")
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      format!("L:{rel_path}:{}", hash_bytes(target.to_string_lossy().as_bytes()))
    } else {
      continue;
    };

    entries.push((rel_path, line));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, line) in entries {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }
  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

#[cfg(unix)]
pub(crate) fn is_executable(entry: &walkdir::DirEntry) -> bool {
  use std::os::unix::fs::PermissionsExt;
  entry.metadata().is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_entry: &walkdir::DirEntry) -> bool {
  false
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read_err = |e: std::io::Error| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };
  let mut file = fs::File::open(path).map_err(read_err)?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];
  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }
  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn empty_directory_hashes() {
    let temp = tempdir().unwrap();
    let hash = hash_directory(temp.path(), &[]).unwrap();
    assert_eq!(hash.0.len(), 64);
    assert_eq!(hash.short(20).len(), 20);
  }

  #[test]
  fn same_tree_same_hash() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    for dir in [a.path(), b.path()] {
      fs::create_dir(dir.join("roles")).unwrap();
      fs::write(dir.join("roles/main.yml"), "- hosts: all").unwrap();
      fs::write(dir.join("site.yml"), "---").unwrap();
    }
    assert_eq!(hash_directory(a.path(), &[]).unwrap(), hash_directory(b.path(), &[]).unwrap());
  }

  #[test]
  fn content_and_layout_change_hash() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("site.yml"), "original").unwrap();
    let first = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("site.yml"), "modified").unwrap();
    let second = hash_directory(temp.path(), &[]).unwrap();
    assert_ne!(first, second);

    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::rename(temp.path().join("site.yml"), temp.path().join("sub/site.yml")).unwrap();
    let third = hash_directory(temp.path(), &[]).unwrap();
    assert_ne!(second, third);
  }

  #[cfg(unix)]
  #[test]
  fn executable_bit_changes_hash() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempdir().unwrap();
    let script = temp.path().join("provision.sh");
    fs::write(&script, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
    let before = hash_directory(temp.path(), &[]).unwrap();

    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let after = hash_directory(temp.path(), &[]).unwrap();
    assert_ne!(before, after);
  }

  #[test]
  fn excluded_names_ignored() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("site.yml"), "content").unwrap();
    let before = hash_directory(temp.path(), &[".git", ".shelver"]).unwrap();

    fs::create_dir_all(temp.path().join(".git/objects")).unwrap();
    fs::write(temp.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
    fs::create_dir(temp.path().join(".shelver")).unwrap();
    let after = hash_directory(temp.path(), &[".git", ".shelver"]).unwrap();

    assert_eq!(before, after);
  }

  #[test]
  fn hash_file_matches_bytes() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("f");
    fs::write(&path, "hello world").unwrap();
    assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hello world"));
  }
}
