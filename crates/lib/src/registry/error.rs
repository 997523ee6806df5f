//! Configuration errors, raised before any build starts.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading the registry, resolving definitions, or planning the
/// build order. All of them are fatal for the whole run.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read registry {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid registry {context}: {message}")]
  Parse { context: String, message: String },

  #[error("unknown image: {0}")]
  UnknownNode(String),

  #[error("image '{node}' has unknown base '{base}'")]
  UnknownBase { node: String, base: String },

  #[error("base cycle: {}", chain.join(" -> "))]
  CycleInBase { chain: Vec<String> },

  #[error("dependency cycle between: {}", nodes.join(", "))]
  CyclicDependency { nodes: Vec<String> },

  #[error("image '{node}': cannot merge '{key}', a {lower} is overridden by a {upper}")]
  MergeConflict {
    node: String,
    key: String,
    lower: &'static str,
    upper: &'static str,
  },

  #[error("image '{node}' is missing required field '{field}'")]
  MissingField { node: String, field: &'static str },

  #[error("image '{node}' references unknown metadata block '{block}'")]
  UnknownBlock { node: String, block: String },

  #[error("defaults may not declare a base")]
  DefaultsBase,

  #[error("invalid image pattern '{pattern}': {message}")]
  Pattern { pattern: String, message: String },
}
