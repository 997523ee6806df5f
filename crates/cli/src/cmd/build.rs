//! Implementation of the `shelver build` command.
//!
//! Plans the requested images, builds them in dependency order and prints one
//! status line per image. Ctrl-C cancels the run: running builders are
//! interrupted and images that have not started are skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use shelver_lib::artifacts::ArtifactHandle;
use shelver_lib::builder::{ExecutorConfig, PackerBuilder};
use shelver_lib::execute::{BuildResult, KnownArtifact, RunOptions, RunReport, run};

use super::Global;
use crate::output::{format_elapsed, print_error, print_json, print_skipped, print_stat, print_success, symbols};

#[derive(Debug, Args)]
pub struct BuildArgs {
  /// Images to build; glob patterns allowed (default: all)
  pub patterns: Vec<String>,

  /// Maximum number of builders running at once
  #[arg(short = 'j', long, default_value_t = 4)]
  pub jobs: usize,

  /// Time limit per builder invocation, in seconds or as a duration like `90m`
  #[arg(long, value_parser = parse_duration)]
  pub timeout: Option<Duration>,

  /// Extra attempts after a builder failure or timeout
  #[arg(long, default_value_t = 0)]
  pub retries: u32,

  /// Pause between attempts
  #[arg(long, value_parser = parse_duration, default_value = "10s")]
  pub retry_delay: Duration,

  /// Reuse recorded artifacts for images that are only dependencies of the targets
  #[arg(long)]
  pub reuse_existing: bool,

  /// Use an existing artifact for a dependency, as NAME=[REGION:]ID (implies --reuse-existing)
  #[arg(long = "artifact", value_name = "NAME=ID", value_parser = parse_artifact)]
  pub artifacts: Vec<KnownArtifact>,

  /// Output as JSON
  #[arg(long)]
  pub json: bool,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
  if let Ok(secs) = value.parse::<u64>() {
    return Ok(Duration::from_secs(secs));
  }
  humantime::parse_duration(value).map_err(|e| e.to_string())
}

fn parse_artifact(value: &str) -> Result<KnownArtifact, String> {
  let (node, id) = value
    .split_once('=')
    .filter(|(node, id)| !node.is_empty() && !id.is_empty())
    .ok_or_else(|| format!("expected NAME=ID, got '{value}'"))?;

  let (region, id) = match id.split_once(':') {
    Some((region, id)) if !region.is_empty() && !id.is_empty() => (Some(region.to_string()), id),
    _ => (None, id),
  };
  Ok(KnownArtifact {
    handle: ArtifactHandle {
      node: node.to_string(),
      id: id.to_string(),
      region,
    },
    version: None,
  })
}

/// Run the build. Returns whether every image succeeded.
pub fn cmd_build(global: &Global, args: &BuildArgs) -> Result<bool> {
  let registry = global.load_registry()?;
  let workspace = global.workspace()?;
  workspace
    .ensure()
    .with_context(|| format!("Failed to create working directories under {}", workspace.base_dir.display()))?;
  let run_dir = workspace.run_dir().context("Failed to create run directory")?;

  let executor = ExecutorConfig {
    command: global.builder_command()?,
    work_dir: run_dir.path().to_path_buf(),
    log_dir: workspace.log_dir.clone(),
    timeout: args.timeout,
    ..Default::default()
  };
  let options = RunOptions {
    max_concurrency: args.jobs.max(1),
    retries: args.retries,
    retry_delay: args.retry_delay,
    reuse_existing: args.reuse_existing || !args.artifacts.is_empty(),
    known_artifacts: args
      .artifacts
      .iter()
      .map(|known| (known.handle.node.clone(), known.clone()))
      .collect(),
    workspace: workspace.clone().with_tmp_dir(run_dir.path()),
  };

  let started = Instant::now();
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(async {
      let cancel = CancellationToken::new();
      let on_interrupt = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          warn!("interrupted, cancelling builds");
          on_interrupt.cancel();
        }
      });

      run(&registry, &args.patterns, &options, Arc::new(PackerBuilder::new(executor)), cancel).await
    })
    .context("Build failed")?;

  if args.json {
    print_json(&RunSummary::new(&report))?;
  } else {
    print_report(&report, started.elapsed());
  }

  Ok(report.is_success())
}

#[derive(Serialize)]
struct RunSummary<'a> {
  success: bool,
  images: Vec<ImageSummary<'a>>,
}

#[derive(Serialize)]
struct ImageSummary<'a> {
  name: &'a str,
  version: Option<&'a str>,
  status: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  artifact: Option<&'a ArtifactHandle>,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  reused: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  reason: Option<String>,
}

impl<'a> RunSummary<'a> {
  fn new(report: &'a RunReport) -> Self {
    let images = report
      .order
      .iter()
      .filter_map(|name| {
        let result = report.get(name)?;
        let (status, artifact, reason) = match result {
          BuildResult::Succeeded(handle) => ("succeeded", Some(handle), None),
          BuildResult::Failed(err) => ("failed", None, Some(err.to_string())),
          BuildResult::Skipped(why) => ("skipped", None, Some(why.to_string())),
        };
        Some(ImageSummary {
          name,
          version: report.versions.get(name).map(String::as_str),
          status,
          artifact,
          reused: report.reused.contains(name),
          reason,
        })
      })
      .collect();

    Self {
      success: report.is_success(),
      images,
    }
  }
}

fn print_report(report: &RunReport, elapsed: Duration) {
  println!();
  for name in &report.order {
    let version = report.versions.get(name).map(String::as_str).unwrap_or("?");
    match report.get(name) {
      Some(BuildResult::Succeeded(handle)) => {
        let reused = if report.reused.contains(name) { " (reused)" } else { "" };
        print_success(&format!("{name} {version} {} {handle}{reused}", symbols::ARROW));
      }
      Some(BuildResult::Failed(err)) => print_error(&format!("{name} {version}: {err}")),
      Some(BuildResult::Skipped(reason)) => print_skipped(&format!("{name} {version}: skipped ({reason})")),
      None => {}
    }
  }

  println!();
  print_stat("Succeeded", &report.succeeded().len().to_string());
  print_stat("Failed", &report.failed().len().to_string());
  print_stat("Skipped", &report.skipped().len().to_string());
  print_stat("Elapsed", &format_elapsed(elapsed));
}
