//! Implementation of the `shelver plan` command.
//!
//! Resolves the requested images and prints the build order without running
//! a builder. Configuration errors surface here exactly as they would before
//! a build.

use anyhow::{Context, Result};
use serde_json::json;

use shelver_lib::execute::plan;

use super::Global;
use crate::output::{print_info, print_json, symbols};

pub fn cmd_plan(global: &Global, patterns: &[String], json: bool) -> Result<()> {
  let registry = global.load_registry()?;
  let plan = plan(&registry, patterns).context("Failed to plan build")?;

  if json {
    let images: Vec<_> = plan.specs_in_order().collect();
    return print_json(&json!({
      "targets": plan.targets,
      "order": plan.order(),
      "images": images,
    }));
  }

  print_info(&format!(
    "Build order ({} image(s), {} requested)",
    plan.order().len(),
    plan.targets.len()
  ));
  for (index, spec) in plan.specs_in_order().enumerate() {
    let marker = if plan.targets.contains(&spec.name) { "" } else { " (dependency)" };
    match &spec.base {
      Some(base) => println!(
        "  {}. {} {} {} {}{}",
        index + 1,
        spec.name,
        spec.version,
        symbols::ARROW,
        base,
        marker
      ),
      None => println!("  {}. {} {}{}", index + 1, spec.name, spec.version, marker),
    }
  }

  Ok(())
}
