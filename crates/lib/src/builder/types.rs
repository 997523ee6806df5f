//! Types for builder invocation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from a single builder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// The builder process could not be started.
  #[error("failed to start builder '{program}': {message}")]
  Spawn { program: String, message: String },

  #[error("builder i/o error: {0}")]
  Io(String),

  /// The builder exited unsuccessfully.
  #[error("builder exited with {}{}", exit_code(.code), error_summary(.errors))]
  BuilderFailure { code: Option<i32>, errors: Vec<String> },

  /// The builder exited successfully without reporting an artifact id.
  #[error("builder finished without reporting an artifact id")]
  BuilderOutputUnparseable,

  #[error("builder timed out after {}", human(.after))]
  BuilderTimeout { after: Duration },

  #[error("build cancelled")]
  Cancelled,
}

fn exit_code(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {code}"),
    None => "no exit code (terminated by signal)".to_string(),
  }
}

fn human(after: &Duration) -> String {
  humantime::format_duration(*after).to_string()
}

fn error_summary(errors: &[String]) -> String {
  if errors.is_empty() {
    String::new()
  } else {
    format!(": {}", errors.join("; "))
  }
}

impl BuildError {
  /// Whether another attempt may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, BuildError::BuilderFailure { .. } | BuildError::BuilderTimeout { .. })
  }
}

impl From<std::io::Error> for BuildError {
  fn from(err: std::io::Error) -> Self {
    BuildError::Io(err.to_string())
  }
}

/// Configuration for builder invocations.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  /// Program and leading arguments; `build -machine-readable <file>` is appended.
  pub command: Vec<String>,

  /// Where request documents are written.
  pub work_dir: PathBuf,

  /// Where per-image logs (`<name>_<version>.log`) are written.
  pub log_dir: PathBuf,

  /// Wall-clock limit per invocation. `None` waits indefinitely.
  pub timeout: Option<Duration>,

  /// How long an interrupted builder may take to exit before it is killed.
  pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    let tmp = std::env::temp_dir();
    Self {
      command: vec!["packer".to_string()],
      work_dir: tmp.clone(),
      log_dir: tmp,
      timeout: None,
      kill_grace: Duration::from_secs(10),
    }
  }
}
