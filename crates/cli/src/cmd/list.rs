//! Implementation of the `shelver list` command.

use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};

use shelver_lib::artifacts::ArtifactStore;

use super::Global;
use crate::output::{print_info, print_json, symbols};

pub fn cmd_list(global: &Global, json: bool) -> Result<()> {
  let workspace = global.workspace()?;
  let path = workspace.artifacts_path();
  let store = ArtifactStore::load(&path).with_context(|| format!("Failed to read {}", path.display()))?;

  if json {
    return print_json(store.entries());
  }

  if store.entries().is_empty() {
    print_info("No artifacts recorded yet. Run 'shelver build' to create some.");
    return Ok(());
  }

  for (node, versions) in store.entries() {
    println!("{node}");
    for (version, record) in versions {
      let built_at = UNIX_EPOCH + Duration::from_secs(record.built_at);
      let id = match &record.region {
        Some(region) => format!("{region}:{}", record.id),
        None => record.id.clone(),
      };
      println!(
        "  {} {version} {} {id} ({})",
        symbols::INFO,
        symbols::ARROW,
        humantime::format_rfc3339_seconds(built_at)
      );
    }
  }

  Ok(())
}
