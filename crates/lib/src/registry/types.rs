//! Registry data model.
//!
//! A [`Definition`] is one layer of image configuration as written in the
//! registry file. Every field is optional: the defaults layer, each ancestor
//! in the `base` chain, and the definition itself are merged into a
//! [`ResolvedSpec`](crate::resolve::ResolvedSpec) where the required fields
//! are checked.
//!
//! # Example
//!
//! ```yaml
//! defaults:
//!   region: us-east-1
//!   instance_type: t3.small
//!
//! base-16.04:
//!   version: "1.0"
//!   archive: { type: git, dir: ansible }
//!   provision: { playbook: base.yml, groups: [base] }
//!
//! zeppelin:
//!   version: "0.7.3"
//!   base: base-16.04
//!   metadata:
//!     - "#cloud-config"
//!     - block: ssh-keys
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One configuration layer: the defaults, a definition, or an ancestor.
///
/// Explicit `null` values deserialize to `None`, which the resolver treats as
/// "inherit from the layer below".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Definition {
  /// Image version, recorded with the produced artifact.
  #[serde(default, deserialize_with = "de_opt_scalar_string", skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  /// Description template, rendered with the build context.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub environment: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instance_type: Option<String>,
  /// Builder template path, relative to the base directory.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template: Option<PathBuf>,
  /// Name of the definition this image is built on top of.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive: Option<ArchiveLayer>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub provision: Option<ProvisionLayer>,
  /// Free-form options merged into every builder of the rendered template.
  #[serde(default, deserialize_with = "de_null_default", skip_serializing_if = "Map::is_empty")]
  pub builder_opts: Map<String, Value>,
  /// Ordered user-data blocks.
  #[serde(default, deserialize_with = "de_null_default", skip_serializing_if = "Vec::is_empty")]
  pub metadata: Vec<MetadataBlock>,
}

impl Definition {
  /// The built-in lowest layer, applied below the registry's own defaults.
  pub fn builtin() -> Self {
    Definition {
      description: Some("{{ name }} - version {{ version }}".to_string()),
      environment: Some("prod".to_string()),
      ..Default::default()
    }
  }
}

/// A user-data block: inline text or a reference to a named registry block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataBlock {
  Text(String),
  Ref { block: String },
}

/// Kind of source tree packaged into a provisioning archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
  /// Tracked content of a git commit.
  Git,
  /// Every regular file under a directory.
  Dir,
}

impl std::fmt::Display for ArchiveKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ArchiveKind::Git => write!(f, "git"),
      ArchiveKind::Dir => write!(f, "dir"),
    }
  }
}

/// Partially specified archive settings, as written in one layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveLayer {
  #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<ArchiveKind>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dir: Option<PathBuf>,
  #[serde(default, deserialize_with = "de_opt_scalar_string", skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
}

/// Partially specified provisioning settings, as written in one layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionLayer {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub playbook: Option<String>,
  #[serde(default, deserialize_with = "de_null_default", skip_serializing_if = "Vec::is_empty")]
  pub groups: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bootstrap: Option<bool>,
}

/// Fully specified archive settings of a resolved image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveSpec {
  #[serde(rename = "type")]
  pub kind: ArchiveKind,
  pub dir: PathBuf,
  /// Git revision to archive; `HEAD` when unset. Ignored for `dir` archives.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
}

/// Fully specified provisioning settings of a resolved image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
  pub playbook: String,
  #[serde(default)]
  pub groups: Vec<String>,
  #[serde(default)]
  pub bootstrap: bool,
}

/// Versions and revisions are often written unquoted (`version: 1.0`).
fn de_opt_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
  }

  Ok(Option::<Scalar>::deserialize(deserializer)?.map(|s| match s {
    Scalar::Str(s) => s,
    Scalar::Int(i) => i.to_string(),
    Scalar::Float(f) => f.to_string(),
    Scalar::Bool(b) => b.to_string(),
  }))
}

fn de_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de> + Default,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
