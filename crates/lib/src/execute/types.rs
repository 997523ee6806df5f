//! Types for orchestrating a run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::artifacts::{ArtifactHandle, StoreError};
use crate::builder::BuildError;
use crate::registry::ConfigError;
use crate::template::RenderError;
use crate::workspace::Workspace;

/// Why a node was not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
  /// The named node (a base somewhere up the chain) failed.
  DependencyFailed(String),
  /// The run was cancelled before the node started.
  Cancelled,
}

impl std::fmt::Display for SkipReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SkipReason::DependencyFailed(node) => write!(f, "dependency failed: {node}"),
      SkipReason::Cancelled => write!(f, "cancelled"),
    }
  }
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
  #[error("render failed: {0}")]
  Render(#[from] RenderError),

  #[error("archive failed: {0}")]
  Archive(#[from] ArchiveError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error("failed to write user data: {0}")]
  UserData(String),

  #[error("build task panicked: {0}")]
  Panicked(String),
}

/// Terminal state of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
  Succeeded(ArtifactHandle),
  Failed(NodeError),
  Skipped(SkipReason),
}

impl BuildResult {
  pub fn artifact(&self) -> Option<&ArtifactHandle> {
    match self {
      BuildResult::Succeeded(handle) => Some(handle),
      _ => None,
    }
  }
}

/// Errors that stop a run before any build starts.
#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to prepare {path}: {source}")]
  Workspace {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// An artifact supplied from outside the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownArtifact {
  pub handle: ArtifactHandle,
  /// Only reuse for this version; `None` matches any version.
  pub version: Option<String>,
}

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
  /// Maximum number of builder invocations in flight.
  pub max_concurrency: usize,

  /// Extra attempts after a retryable builder failure.
  pub retries: u32,

  /// Pause between attempts.
  pub retry_delay: Duration,

  /// Skip building dependencies (nodes that are not explicit targets) that
  /// already have an artifact for their version.
  pub reuse_existing: bool,

  /// Artifacts to consider for reuse besides the artifact store.
  pub known_artifacts: HashMap<String, KnownArtifact>,

  pub workspace: Workspace,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      max_concurrency: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
      retries: 0,
      retry_delay: Duration::from_secs(10),
      reuse_existing: false,
      known_artifacts: HashMap::new(),
      workspace: Workspace::new("."),
    }
  }
}

/// Outcome of a run: one result per node of the build closure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
  /// Build order of the closure.
  pub order: Vec<String>,
  /// Resolved version of every node.
  pub versions: BTreeMap<String, String>,
  pub results: BTreeMap<String, BuildResult>,
  /// Nodes satisfied by an existing artifact instead of a build.
  pub reused: BTreeSet<String>,
}

impl RunReport {
  /// True when every node succeeded. An empty run is a success.
  pub fn is_success(&self) -> bool {
    self.results.values().all(|r| matches!(r, BuildResult::Succeeded(_)))
  }

  pub fn get(&self, node: &str) -> Option<&BuildResult> {
    self.results.get(node)
  }

  pub fn succeeded(&self) -> Vec<&str> {
    self.in_order(|r| matches!(r, BuildResult::Succeeded(_)))
  }

  pub fn failed(&self) -> Vec<&str> {
    self.in_order(|r| matches!(r, BuildResult::Failed(_)))
  }

  pub fn skipped(&self) -> Vec<&str> {
    self.in_order(|r| matches!(r, BuildResult::Skipped(_)))
  }

  fn in_order(&self, keep: impl Fn(&BuildResult) -> bool) -> Vec<&str> {
    self
      .order
      .iter()
      .filter(|name| self.results.get(*name).is_some_and(&keep))
      .map(String::as_str)
      .collect()
  }
}
