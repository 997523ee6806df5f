//! Gzipped user data for image builds.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::resolve::ResolvedSpec;

/// Write the spec's metadata blocks, joined by newlines, to a gzipped file
/// in `dir`. Returns `None` when there is no metadata.
pub fn write_user_data(dir: &Path, spec: &ResolvedSpec) -> io::Result<Option<PathBuf>> {
  if spec.metadata.is_empty() {
    return Ok(None);
  }

  fs::create_dir_all(dir)?;
  let path = dir.join(format!("{}_{}.user-data.gz", spec.name, spec.version));
  let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
  encoder.write_all(spec.user_data().as_bytes())?;
  encoder.finish()?.sync_all()?;
  Ok(Some(path))
}
