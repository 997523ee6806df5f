//! Reading every regular file under a plain directory.

use std::path::Path;

use walkdir::WalkDir;

use super::ArchiveError;
use super::tarball::{Contents, EntryData, SourceEntry};
use crate::util::hash::is_executable;

pub(crate) fn dir_entries(root: &Path, exclude: &[&str]) -> Result<Vec<SourceEntry>, ArchiveError> {
  let walker = WalkDir::new(root)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  let mut entries = Vec::new();
  for entry in walker {
    let entry = entry.map_err(|e| ArchiveError::Io {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;
    let Ok(rel) = entry.path().strip_prefix(root) else {
      continue;
    };
    let path = rel.to_string_lossy().replace('\\', "/");
    let file_type = entry.file_type();

    let data = if file_type.is_file() {
      EntryData::File {
        contents: Contents::Path(entry.path().to_path_buf()),
        executable: is_executable(&entry),
      }
    } else if file_type.is_symlink() {
      let target = std::fs::read_link(entry.path()).map_err(|e| ArchiveError::Io {
        path: entry.path().to_path_buf(),
        message: e.to_string(),
      })?;
      EntryData::Symlink(target.to_string_lossy().replace('\\', "/"))
    } else {
      continue;
    };
    entries.push(SourceEntry { path, data });
  }
  Ok(entries)
}
