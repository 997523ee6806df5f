//! Built artifacts and the local record of previous runs.
//!
//! An [`ArtifactHandle`] is what a successful build hands to the images built
//! on top of it. The [`ArtifactStore`] persists handles per `(image, version)`
//! in `.shelver/artifacts.json` so later runs can reuse them instead of
//! rebuilding dependencies.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier of a built image, e.g. an AMI id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
  /// Image that produced the artifact.
  pub node: String,
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
}

impl std::fmt::Display for ArtifactHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.region {
      Some(region) => write!(f, "{region}:{}", self.id),
      None => write!(f, "{}", self.id),
    }
  }
}

/// A persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  /// Seconds since the Unix epoch.
  pub built_at: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to access artifact store {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("corrupt artifact store {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Artifacts keyed by image name, then version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactIndex(pub BTreeMap<String, BTreeMap<String, ArtifactRecord>>);

/// JSON-file backed artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
  path: PathBuf,
  index: ArtifactIndex,
}

impl ArtifactStore {
  /// Open the store at `path`. A missing file is an empty store.
  pub fn load(path: &Path) -> Result<Self, StoreError> {
    let index = match std::fs::read_to_string(path) {
      Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
      })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => ArtifactIndex::default(),
      Err(source) => {
        return Err(StoreError::Io {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    Ok(Self {
      path: path.to_path_buf(),
      index,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn get(&self, node: &str, version: &str) -> Option<ArtifactHandle> {
    let record = self.index.0.get(node)?.get(version)?;
    Some(ArtifactHandle {
      node: node.to_string(),
      id: record.id.clone(),
      region: record.region.clone(),
    })
  }

  /// All recorded versions of every image.
  pub fn entries(&self) -> &BTreeMap<String, BTreeMap<String, ArtifactRecord>> {
    &self.index.0
  }

  /// Record `handle` as the artifact of `version`, replacing a previous one.
  pub fn record(&mut self, version: &str, handle: &ArtifactHandle) {
    let built_at = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or(0);
    let record = ArtifactRecord {
      id: handle.id.clone(),
      region: handle.region.clone(),
      built_at,
    };

    let versions = self.index.0.entry(handle.node.clone()).or_default();
    if let Some(previous) = versions.insert(version.to_string(), record)
      && previous.id != handle.id
    {
      warn!(
        node = %handle.node,
        version,
        previous = %previous.id,
        current = %handle.id,
        "replacing recorded artifact"
      );
    }
  }

  /// Write the store atomically.
  pub fn save(&self) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
      path: self.path.clone(),
      source,
    };
    let dir = self.path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let content = serde_json::to_string_pretty(&self.index).map_err(|source| StoreError::Parse {
      path: self.path.clone(),
      source,
    })?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.persist(&self.path).map_err(|e| io_err(e.error))?;

    debug!(path = %self.path.display(), "saved artifact store");
    Ok(())
  }
}
