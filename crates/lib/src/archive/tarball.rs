//! Deterministic `tar.gz` writer.
//!
//! Identical entries produce byte-identical output: entries are sorted by
//! path, timestamps and ownership are zeroed, modes are normalized and the
//! gzip header carries no timestamp or file name.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};

/// Where a file's bytes come from.
#[derive(Debug)]
pub(crate) enum Contents {
  Bytes(Vec<u8>),
  Path(PathBuf),
}

#[derive(Debug)]
pub(crate) enum EntryData {
  File { contents: Contents, executable: bool },
  Symlink(String),
}

/// One archive member, with a `/`-separated path relative to the archive root.
#[derive(Debug)]
pub(crate) struct SourceEntry {
  pub path: String,
  pub data: EntryData,
}

pub(crate) fn write<W: Write>(mut entries: Vec<SourceEntry>, out: W) -> io::Result<W> {
  entries.sort_by(|a, b| a.path.cmp(&b.path));

  let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
  builder.mode(tar::HeaderMode::Deterministic);

  for entry in entries {
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    match entry.data {
      EntryData::File { contents, executable } => {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(if executable { 0o755 } else { 0o644 });
        match contents {
          Contents::Bytes(bytes) => {
            header.set_size(bytes.len() as u64);
            builder.append_data(&mut header, &entry.path, bytes.as_slice())?;
          }
          Contents::Path(path) => {
            let file = File::open(&path)?;
            header.set_size(file.metadata()?.len());
            builder.append_data(&mut header, &entry.path, file)?;
          }
        }
      }
      EntryData::Symlink(target) => {
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, &entry.path, &target)?;
      }
    }
  }

  builder.into_inner()?.finish()
}
