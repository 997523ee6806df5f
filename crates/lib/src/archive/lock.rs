//! Cross-process lock on the archive cache directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::consts::APP_NAME;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockMetadata {
  version: u32,
  pid: u32,
  started_at_unix: u64,
  holder: String,
}

/// Exclusive lock on a cache directory, released on drop.
pub struct CacheLock {
  file: File,
}

impl CacheLock {
  /// Block until the lock on `dir` is held. While another process holds it,
  /// its recorded holder is logged once.
  pub fn acquire(dir: &Path, holder: &str) -> io::Result<Self> {
    let path = dir.join(LOCK_FILENAME);
    let file = open(dir)?;
    match lock(&file, false) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        match read_metadata(&file) {
          Ok(current) => info!(
            path = %path.display(),
            holder = %current.holder,
            pid = current.pid,
            "waiting for archive cache lock"
          ),
          Err(_) => info!(path = %path.display(), "waiting for archive cache lock"),
        }
        lock(&file, true)?;
      }
      Err(e) => return Err(e),
    }

    let lock = CacheLock { file };
    lock.write_metadata(holder)?;
    Ok(lock)
  }

  fn write_metadata(&self, holder: &str) -> io::Result<()> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      holder: format!("{APP_NAME} {holder}"),
    };

    self.file.set_len(0)?;
    let mut writer = io::BufWriter::new(&self.file);
    serde_json::to_writer_pretty(&mut writer, &metadata).map_err(io::Error::other)?;
    writer.flush()
  }
}

fn read_metadata(mut file: &File) -> io::Result<LockMetadata> {
  file.seek(SeekFrom::Start(0))?;
  let mut contents = String::new();
  file.read_to_string(&mut contents)?;
  serde_json::from_str(&contents).map_err(io::Error::other)
}

fn open(dir: &Path) -> io::Result<File> {
  std::fs::create_dir_all(dir)?;
  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(dir.join(LOCK_FILENAME))
}

#[cfg(unix)]
fn lock(file: &File, wait: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = if wait {
    FlockOperation::LockExclusive
  } else {
    FlockOperation::NonBlockingLockExclusive
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn lock(file: &File, wait: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = if wait {
    LOCKFILE_EXCLUSIVE_LOCK
  } else {
    LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK
  };

  // SAFETY: OVERLAPPED is valid zero-initialized and the handle is owned by `file`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
