//! Test helpers shared across modules.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Whether a `git` binary is on PATH. Git-backed tests return early without it.
pub fn git_available() -> bool {
  Command::new("git").arg("--version").output().is_ok_and(|o| o.status.success())
}

/// Run git in `dir` with a fixed identity and return trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
  let output = Command::new("git")
    .args([
      "-c",
      "user.name=shelver",
      "-c",
      "user.email=shelver@example.com",
      "-c",
      "commit.gpgsign=false",
      "-c",
      "init.defaultBranch=main",
    ])
    .args(args)
    .current_dir(dir)
    .output()
    .unwrap();
  assert!(
    output.status.success(),
    "git {args:?} failed: {}",
    String::from_utf8_lossy(&output.stderr)
  );
  String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Write an executable shell script standing in for the image builder.
///
/// The script receives `build -machine-readable <request.json>` like the
/// real builder does.
#[cfg(unix)]
pub fn fake_builder(dir: &Path, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}
