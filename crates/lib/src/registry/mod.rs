//! Image registry: named definitions, shared defaults and metadata blocks.
//!
//! The registry file is a YAML mapping. Two keys are reserved:
//! - `defaults`: the lowest-precedence [`Definition`] layer
//! - `blocks`: named text blocks referenced from `metadata`
//!
//! Every other key names an image definition. YAML anchors and aliases are
//! expanded by the parser, so `<<: *common` style sharing works as expected.

mod error;
mod types;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use globset::Glob;
use serde_yaml::Value as YamlValue;
use tracing::debug;

pub use error::ConfigError;
pub use types::{
  ArchiveKind, ArchiveLayer, ArchiveSpec, Definition, MetadataBlock, Provision, ProvisionLayer,
};

use crate::consts::{BLOCKS_KEY, DEFAULTS_KEY};

/// The loaded set of image definitions. Immutable after construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
  defaults: Definition,
  blocks: BTreeMap<String, String>,
  definitions: BTreeMap<String, Definition>,
}

impl Registry {
  /// Build a registry from already parsed parts.
  ///
  /// Fails with [`ConfigError::DefaultsBase`] if the defaults declare a base.
  pub fn new(
    defaults: Definition,
    blocks: BTreeMap<String, String>,
    definitions: BTreeMap<String, Definition>,
  ) -> Result<Self, ConfigError> {
    if defaults.base.is_some() {
      return Err(ConfigError::DefaultsBase);
    }
    Ok(Self {
      defaults,
      blocks,
      definitions,
    })
  }

  /// Read and parse a registry file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let registry = Self::from_yaml_str(&content).map_err(|e| match e {
      ConfigError::Parse { context, message } if context == "document" => ConfigError::Parse {
        context: path.display().to_string(),
        message,
      },
      other => other,
    })?;
    debug!(path = %path.display(), images = registry.definitions.len(), "loaded registry");
    Ok(registry)
  }

  /// Parse a registry from YAML text.
  pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
    let document: YamlValue = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
      context: "document".to_string(),
      message: e.to_string(),
    })?;

    let mapping = match document {
      YamlValue::Mapping(mapping) => mapping,
      YamlValue::Null => Default::default(),
      _ => {
        return Err(ConfigError::Parse {
          context: "document".to_string(),
          message: "expected a mapping of image definitions".to_string(),
        });
      }
    };

    let mut defaults = Definition::default();
    let mut blocks = BTreeMap::new();
    let mut definitions = BTreeMap::new();

    for (key, value) in mapping {
      let YamlValue::String(name) = key else {
        return Err(ConfigError::Parse {
          context: "document".to_string(),
          message: format!("image names must be strings, got {key:?}"),
        });
      };
      let mut value = value;
      value.apply_merge().map_err(|e| parse_error(&name, e))?;

      match name.as_str() {
        DEFAULTS_KEY => defaults = parse_layer(&name, value)?,
        BLOCKS_KEY => {
          if !value.is_null() {
            blocks = serde_yaml::from_value(value).map_err(|e| parse_error(&name, e))?;
          }
        }
        _ => {
          let definition = parse_layer(&name, value)?;
          definitions.insert(name, definition);
        }
      }
    }

    Self::new(defaults, blocks, definitions)
  }

  pub fn defaults(&self) -> &Definition {
    &self.defaults
  }

  pub fn blocks(&self) -> &BTreeMap<String, String> {
    &self.blocks
  }

  pub fn get(&self, name: &str) -> Option<&Definition> {
    self.definitions.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.definitions.contains_key(name)
  }

  /// Definition names in sorted order.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.definitions.keys().map(String::as_str)
  }

  /// Expand glob patterns (`*`, `spark-*`) into definition names.
  ///
  /// Names are returned in pattern order, sorted by name within one pattern,
  /// without duplicates. An empty pattern list selects every definition. A
  /// pattern that matches nothing is an [`ConfigError::UnknownNode`].
  pub fn match_targets<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<String>, ConfigError> {
    if patterns.is_empty() {
      return Ok(self.names().map(str::to_string).collect());
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for pattern in patterns {
      let pattern = pattern.as_ref();
      let matcher = Glob::new(pattern)
        .map_err(|e| ConfigError::Pattern {
          pattern: pattern.to_string(),
          message: e.to_string(),
        })?
        .compile_matcher();

      let mut matched = false;
      for name in self.names().filter(|name| matcher.is_match(name)) {
        matched = true;
        if seen.insert(name) {
          targets.push(name.to_string());
        }
      }
      if !matched {
        return Err(ConfigError::UnknownNode(pattern.to_string()));
      }
    }
    Ok(targets)
  }
}

fn parse_layer(name: &str, value: YamlValue) -> Result<Definition, ConfigError> {
  if value.is_null() {
    return Ok(Definition::default());
  }
  serde_yaml::from_value(value).map_err(|e| parse_error(name, e))
}

fn parse_error(name: &str, err: serde_yaml::Error) -> ConfigError {
  ConfigError::Parse {
    context: format!("entry '{name}'"),
    message: err.to_string(),
  }
}
