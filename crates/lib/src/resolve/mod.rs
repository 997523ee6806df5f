//! Config resolution: from a registry entry to a fully merged [`ResolvedSpec`].
//!
//! Layers are applied oldest to newest: the built-in defaults, the registry
//! `defaults`, then each definition of the `base` chain from the root down to
//! the target. See [`deep_merge`] for the merge rules.

mod merge;

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use merge::{MergeConflict, deep_merge};

use crate::registry::{
  ArchiveKind, ArchiveSpec, ConfigError, Definition, MetadataBlock, Provision, Registry,
};

/// A definition merged with everything it inherits.
///
/// Serialization is deterministic: resolving the same registry twice yields
/// byte-identical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSpec {
  pub name: String,
  pub version: String,
  /// Unrendered description template.
  pub description: String,
  pub environment: String,
  pub region: String,
  pub instance_type: String,
  /// Builder template path; the built-in template is used when unset.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive: Option<ArchiveSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub provision: Option<Provision>,
  #[serde(default)]
  pub builder_opts: Map<String, Value>,
  /// Metadata blocks with references expanded.
  #[serde(default)]
  pub metadata: Vec<String>,
}

impl ResolvedSpec {
  /// Name of the produced image: `<name>-v<version>`.
  pub fn artifact_name(&self) -> String {
    format!("{}-v{}", self.name, self.version)
  }

  /// Metadata blocks joined into the instance user data.
  pub fn user_data(&self) -> String {
    self.metadata.join("\n")
  }
}

/// Resolve `target` against the registry. Pure: reads nothing but `registry`.
pub fn resolve(registry: &Registry, target: &str) -> Result<ResolvedSpec, ConfigError> {
  if registry.defaults().base.is_some() {
    return Err(ConfigError::DefaultsBase);
  }

  let chain = base_chain(registry, target)?;

  let mut merged = layer_value(target, &Definition::builtin())?;
  merged = merge_layer(target, merged, layer_value(target, registry.defaults())?)?;
  for name in chain.iter().rev() {
    let definition = registry
      .get(name)
      .ok_or_else(|| ConfigError::UnknownNode(name.clone()))?;
    merged = merge_layer(target, merged, layer_value(target, definition)?)?;
  }

  let merged: Definition = serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
    context: format!("entry '{target}'"),
    message: e.to_string(),
  })?;

  let own_base = registry.get(target).and_then(|d| d.base.clone());
  finish(target, own_base, merged, registry)
}

/// Walk `base` references from `target` up to its root. The returned chain
/// starts with `target`.
pub fn base_chain(registry: &Registry, target: &str) -> Result<Vec<String>, ConfigError> {
  let mut chain = Vec::new();
  let mut visited = HashSet::new();
  let mut current = target.to_string();

  loop {
    let definition = registry.get(&current).ok_or_else(|| match chain.last() {
      None => ConfigError::UnknownNode(current.clone()),
      Some(child) => ConfigError::UnknownBase {
        node: String::clone(child),
        base: current.clone(),
      },
    })?;
    visited.insert(current.clone());
    chain.push(current.clone());

    match &definition.base {
      None => return Ok(chain),
      Some(base) if visited.contains(base) => {
        chain.push(base.clone());
        return Err(ConfigError::CycleInBase { chain });
      }
      Some(base) => current = base.clone(),
    }
  }
}

fn layer_value(node: &str, definition: &Definition) -> Result<Value, ConfigError> {
  serde_json::to_value(definition).map_err(|e| ConfigError::Parse {
    context: format!("entry '{node}'"),
    message: e.to_string(),
  })
}

fn merge_layer(node: &str, lower: Value, upper: Value) -> Result<Value, ConfigError> {
  deep_merge(lower, upper).map_err(|conflict| ConfigError::MergeConflict {
    node: node.to_string(),
    key: conflict.key,
    lower: conflict.lower,
    upper: conflict.upper,
  })
}

fn finish(
  name: &str,
  base: Option<String>,
  merged: Definition,
  registry: &Registry,
) -> Result<ResolvedSpec, ConfigError> {
  let missing = |field: &'static str| ConfigError::MissingField {
    node: name.to_string(),
    field,
  };

  let archive = match merged.archive {
    None => None,
    Some(layer) => Some(ArchiveSpec {
      kind: layer.kind.unwrap_or(ArchiveKind::Git),
      dir: layer.dir.ok_or_else(|| missing("archive.dir"))?,
      revision: layer.revision,
    }),
  };

  let provision = match merged.provision {
    None => None,
    Some(layer) => Some(Provision {
      playbook: layer.playbook.ok_or_else(|| missing("provision.playbook"))?,
      groups: layer.groups,
      bootstrap: layer.bootstrap.unwrap_or(false),
    }),
  };

  let metadata = merged
    .metadata
    .into_iter()
    .map(|block| match block {
      MetadataBlock::Text(text) => Ok(text),
      MetadataBlock::Ref { block } => registry
        .blocks()
        .get(&block)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownBlock {
          node: name.to_string(),
          block,
        }),
    })
    .collect::<Result<Vec<_>, _>>()?;

  Ok(ResolvedSpec {
    name: name.to_string(),
    version: merged.version.ok_or_else(|| missing("version"))?,
    description: merged.description.ok_or_else(|| missing("description"))?,
    environment: merged.environment.ok_or_else(|| missing("environment"))?,
    region: merged.region.ok_or_else(|| missing("region"))?,
    instance_type: merged.instance_type.ok_or_else(|| missing("instance_type"))?,
    template: merged.template,
    base,
    archive,
    provision,
    builder_opts: merged.builder_opts,
    metadata,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const REGISTRY: &str = r##"
defaults:
  region: us-east-1
  instance_type: t3.small
  builder_opts:
    ssh_username: ubuntu
    launch_block_device_mappings:
      - device_name: /dev/sda1
  metadata:
    - "#cloud-config"

blocks:
  keys: "ssh_authorized_keys: [abc]"

base-16.04:
  version: "1.0"
  archive:
    type: git
    dir: ansible
  provision:
    playbook: base.yml
    groups: [base]
  metadata:
    - block: keys

spark-worker:
  version: "2.1"
  base: base-16.04
  instance_type: m5.large
  environment: ~
  provision:
    groups: [spark]
    bootstrap: true
  builder_opts:
    launch_block_device_mappings:
      - device_name: /dev/sdb
"##;

  fn registry() -> Registry {
    Registry::from_yaml_str(REGISTRY).unwrap()
  }

  #[test]
  fn defaults_fill_unset_fields() {
    let spec = resolve(&registry(), "base-16.04").unwrap();
    assert_eq!(spec.region, "us-east-1");
    assert_eq!(spec.instance_type, "t3.small");
    assert_eq!(spec.environment, "prod");
    assert_eq!(spec.description, "{{ name }} - version {{ version }}");
    assert_eq!(spec.base, None);
    assert_eq!(spec.artifact_name(), "base-16.04-v1.0");
  }

  #[test]
  fn child_overrides_and_inherits_from_base() {
    let spec = resolve(&registry(), "spark-worker").unwrap();
    assert_eq!(spec.version, "2.1");
    assert_eq!(spec.instance_type, "m5.large");
    assert_eq!(spec.base.as_deref(), Some("base-16.04"));

    let provision = spec.provision.unwrap();
    assert_eq!(provision.playbook, "base.yml");
    assert_eq!(provision.groups, vec!["base", "spark"]);
    assert!(provision.bootstrap);

    let archive = spec.archive.unwrap();
    assert_eq!(archive.kind, ArchiveKind::Git);
    assert_eq!(archive.dir, PathBuf::from("ansible"));
  }

  #[test]
  fn nearest_layer_wins_across_three_layers() {
    let registry = Registry::from_yaml_str(
      r#"
defaults:
  region: eu-west-1
  instance_type: t3.small
base:
  version: "1"
  region: us-east-1
  instance_type: m5.large
child:
  version: "2"
  base: base
  instance_type: c5.xlarge
"#,
    )
    .unwrap();

    let spec = resolve(&registry, "child").unwrap();
    assert_eq!(spec.region, "us-east-1");
    assert_eq!(spec.instance_type, "c5.xlarge");
    assert_eq!(spec.version, "2");
  }

  #[test]
  fn explicit_null_inherits() {
    let spec = resolve(&registry(), "spark-worker").unwrap();
    assert_eq!(spec.environment, "prod");
  }

  #[test]
  fn lists_concatenate_defaults_first() {
    let spec = resolve(&registry(), "spark-worker").unwrap();
    assert_eq!(spec.metadata, vec!["#cloud-config", "ssh_authorized_keys: [abc]"]);
    assert_eq!(
      spec.builder_opts["launch_block_device_mappings"],
      json!([{"device_name": "/dev/sda1"}, {"device_name": "/dev/sdb"}])
    );
    assert_eq!(spec.builder_opts["ssh_username"], json!("ubuntu"));
  }

  #[test]
  fn resolution_is_deterministic() {
    let registry = registry();
    let first = serde_json::to_string(&resolve(&registry, "spark-worker").unwrap()).unwrap();
    let second = serde_json::to_string(&resolve(&registry, "spark-worker").unwrap()).unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn unknown_node() {
    let result = resolve(&registry(), "hadoop");
    assert!(matches!(result, Err(ConfigError::UnknownNode(n)) if n == "hadoop"));
  }

  #[test]
  fn unknown_base() {
    let registry = Registry::from_yaml_str("a:\n  version: '1'\n  base: ghost\n").unwrap();
    let result = resolve(&registry, "a");
    assert!(matches!(
      result,
      Err(ConfigError::UnknownBase { node, base }) if node == "a" && base == "ghost"
    ));
  }

  #[test]
  fn cycle_in_base() {
    let yaml = "a:\n  base: b\nb:\n  base: c\nc:\n  base: a\n";
    let registry = Registry::from_yaml_str(yaml).unwrap();
    let result = resolve(&registry, "a");
    assert!(matches!(
      result,
      Err(ConfigError::CycleInBase { chain }) if chain == vec!["a", "b", "c", "a"]
    ));
  }

  #[test]
  fn self_base_is_cycle() {
    let registry = Registry::from_yaml_str("a:\n  base: a\n").unwrap();
    assert!(matches!(resolve(&registry, "a"), Err(ConfigError::CycleInBase { .. })));
  }

  #[test]
  fn missing_required_field() {
    let registry = Registry::from_yaml_str("a:\n  region: r\n  instance_type: t\n").unwrap();
    let result = resolve(&registry, "a");
    assert!(matches!(
      result,
      Err(ConfigError::MissingField { field: "version", .. })
    ));
  }

  #[test]
  fn missing_archive_dir() {
    let yaml = "a:\n  version: '1'\n  region: r\n  instance_type: t\n  archive:\n    type: dir\n";
    let registry = Registry::from_yaml_str(yaml).unwrap();
    assert!(matches!(
      resolve(&registry, "a"),
      Err(ConfigError::MissingField { field: "archive.dir", .. })
    ));
  }

  #[test]
  fn unknown_block() {
    let yaml = "a:\n  version: '1'\n  region: r\n  instance_type: t\n  metadata:\n    - block: nope\n";
    let registry = Registry::from_yaml_str(yaml).unwrap();
    assert!(matches!(
      resolve(&registry, "a"),
      Err(ConfigError::UnknownBlock { block, .. }) if block == "nope"
    ));
  }

  #[test]
  fn structural_mismatch_conflicts() {
    let yaml = r#"
defaults:
  builder_opts:
    tags: { team: data }
a:
  version: "1"
  region: r
  instance_type: t
  builder_opts:
    tags: [team]
"#;
    let registry = Registry::from_yaml_str(yaml).unwrap();
    assert!(matches!(
      resolve(&registry, "a"),
      Err(ConfigError::MergeConflict { key, .. }) if key == "builder_opts.tags"
    ));
  }

  #[test]
  fn base_chain_lists_target_first() {
    let chain = base_chain(&registry(), "spark-worker").unwrap();
    assert_eq!(chain, vec!["spark-worker", "base-16.04"]);
  }
}
