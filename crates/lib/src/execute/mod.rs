//! Run orchestration.
//!
//! A run has two phases:
//! - plan: expand targets, order the build closure and resolve every node.
//!   Any configuration error aborts here, before a builder is started.
//! - build: one task per node, started as soon as its base succeeded and
//!   bounded by a semaphore. A failed node skips its dependents while
//!   independent branches continue.

mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use types::{BuildResult, KnownArtifact, NodeError, RunError, RunOptions, RunReport, SkipReason};

use crate::archive::ArchiveCache;
use crate::artifacts::{ArtifactHandle, ArtifactStore};
use crate::builder::{BuildError, ImageBuilder, write_user_data};
use crate::graph::BuildGraph;
use crate::registry::{ConfigError, Registry};
use crate::resolve::{ResolvedSpec, resolve};
use crate::template::{RuntimeContext, load_template, render};

/// The validated input of a run.
#[derive(Debug)]
pub struct Plan {
  /// Explicitly requested nodes, after pattern expansion.
  pub targets: Vec<String>,
  pub graph: BuildGraph,
  pub specs: BTreeMap<String, ResolvedSpec>,
}

impl Plan {
  pub fn order(&self) -> &[String] {
    self.graph.order()
  }

  /// Resolved specs in build order.
  pub fn specs_in_order(&self) -> impl Iterator<Item = &ResolvedSpec> {
    self.order().iter().filter_map(|name| self.specs.get(name))
  }
}

/// Expand `patterns`, order the closure and resolve every node.
///
/// An empty pattern list selects every definition.
pub fn plan<S: AsRef<str>>(registry: &Registry, patterns: &[S]) -> Result<Plan, ConfigError> {
  let targets = registry.match_targets(patterns)?;
  let graph = BuildGraph::from_targets(registry, &targets)?;

  let specs = graph
    .order()
    .iter()
    .map(|name| Ok((name.clone(), resolve(registry, name)?)))
    .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

  debug!(targets = ?targets, order = ?graph.order(), "planned run");
  Ok(Plan { targets, graph, specs })
}

/// Plan and build `targets`.
pub async fn run<S, B>(
  registry: &Registry,
  targets: &[S],
  options: &RunOptions,
  builder: Arc<B>,
  cancel: CancellationToken,
) -> Result<RunReport, RunError>
where
  S: AsRef<str>,
  B: ImageBuilder,
{
  let plan = plan(registry, targets)?;
  execute_plan(plan, options, builder, cancel).await
}

/// Build a previously computed plan.
pub async fn execute_plan<B: ImageBuilder>(
  plan: Plan,
  options: &RunOptions,
  builder: Arc<B>,
  cancel: CancellationToken,
) -> Result<RunReport, RunError> {
  let workspace = &options.workspace;
  workspace.ensure().map_err(|source| RunError::Workspace {
    path: workspace.tmp_dir.clone(),
    source,
  })?;
  let store = ArtifactStore::load(&workspace.artifacts_path())?;

  info!(nodes = plan.order().len(), targets = ?plan.targets, "starting run");

  let shared = Arc::new(NodeContext {
    base_dir: workspace.base_dir.clone(),
    tmp_dir: workspace.tmp_dir.clone(),
    retries: options.retries,
    retry_delay: options.retry_delay,
    archives: ArchiveCache::new(&workspace.base_dir, &workspace.cache_dir),
    semaphore: Semaphore::new(options.max_concurrency.max(1)),
    builder,
    cancel,
  });

  let scheduler = Scheduler {
    plan,
    options,
    store,
    shared,
    results: BTreeMap::new(),
    artifacts: HashMap::new(),
    reused: BTreeSet::new(),
    tasks: JoinSet::new(),
    running: HashMap::new(),
  };
  Ok(scheduler.run().await)
}

/// Per-run state shared with node tasks.
struct NodeContext<B> {
  base_dir: PathBuf,
  tmp_dir: PathBuf,
  retries: u32,
  retry_delay: Duration,
  archives: ArchiveCache,
  semaphore: Semaphore,
  builder: Arc<B>,
  cancel: CancellationToken,
}

/// Owns the result map; node tasks only report back through the join set.
struct Scheduler<'a, B> {
  plan: Plan,
  options: &'a RunOptions,
  store: ArtifactStore,
  shared: Arc<NodeContext<B>>,
  results: BTreeMap<String, BuildResult>,
  artifacts: HashMap<String, ArtifactHandle>,
  reused: BTreeSet<String>,
  tasks: JoinSet<BuildResult>,
  running: HashMap<tokio::task::Id, String>,
}

impl<B: ImageBuilder> Scheduler<'_, B> {
  async fn run(mut self) -> RunReport {
    self.accept_reusable();
    let needed = self.needed();
    let order: Vec<String> = self
      .plan
      .order()
      .iter()
      .filter(|name| needed.contains(*name) || self.reused.contains(*name))
      .cloned()
      .collect();
    if order.len() < self.plan.order().len() {
      debug!(order = ?order, "reused artifacts cover part of the closure");
    }

    let mut ready: VecDeque<String> = order
      .iter()
      .filter(|name| !self.results.contains_key(*name))
      .filter(|name| match self.plan.graph.base_of(name) {
        Some(base) => self.artifacts.contains_key(base),
        None => true,
      })
      .cloned()
      .collect();

    loop {
      while let Some(name) = ready.pop_front() {
        if self.shared.cancel.is_cancelled() {
          self.results.insert(name, BuildResult::Skipped(SkipReason::Cancelled));
        } else {
          self.spawn(name);
        }
      }

      let Some(joined) = self.tasks.join_next_with_id().await else {
        break;
      };
      let (name, result) = match joined {
        Ok((id, result)) => (self.running.remove(&id), result),
        Err(e) => {
          let name = self.running.remove(&e.id());
          error!(node = ?name, error = %e, "build task panicked");
          (name, BuildResult::Failed(NodeError::Panicked(e.to_string())))
        }
      };
      let Some(name) = name else {
        continue;
      };

      match &result {
        BuildResult::Succeeded(handle) => {
          info!(node = %name, artifact = %handle, "build succeeded");
          self.record(&name, handle);
          self.artifacts.insert(name.clone(), handle.clone());
          ready.extend(
            self
              .plan
              .graph
              .children_of(&name)
              .into_iter()
              .filter(|child| needed.contains(child) && !self.results.contains_key(child)),
          );
        }
        BuildResult::Failed(err) => {
          error!(node = %name, error = %err, "build failed");
          self.skip_dependents(&name);
        }
        BuildResult::Skipped(reason) => {
          debug!(node = %name, reason = %reason, "build skipped");
          self.skip_dependents(&name);
        }
      }
      self.results.insert(name, result);
    }

    // Nodes never reached (cancelled before their base finished).
    for name in &order {
      self
        .results
        .entry(name.clone())
        .or_insert(BuildResult::Skipped(SkipReason::Cancelled));
    }

    let report = RunReport {
      versions: order
        .iter()
        .filter_map(|name| Some((name.clone(), self.plan.specs.get(name)?.version.clone())))
        .collect(),
      order,
      results: self.results,
      reused: self.reused,
    };
    info!(
      succeeded = report.succeeded().len(),
      failed = report.failed().len(),
      skipped = report.skipped().len(),
      "run finished"
    );
    report
  }

  fn spawn(&mut self, name: String) {
    let Some(spec) = self.plan.specs.get(&name).cloned() else {
      self.results.insert(
        name.clone(),
        BuildResult::Failed(NodeError::Panicked(format!("no resolved spec for '{name}'"))),
      );
      return;
    };
    let base_artifact = self
      .plan
      .graph
      .base_of(&name)
      .and_then(|base| self.artifacts.get(base).cloned());

    debug!(node = %name, base = ?spec.base, "scheduling build");
    let shared = self.shared.clone();
    let handle = self.tasks.spawn(build_node(shared, spec, base_artifact));
    self.running.insert(handle.id(), name);
  }

  /// Mark every dependency with an existing artifact as succeeded before
  /// anything is scheduled, so its own bases need not be built.
  fn accept_reusable(&mut self) {
    for name in self.plan.order().to_vec() {
      if let Some(handle) = self.reusable(&name) {
        info!(node = %name, artifact = %handle, "reusing existing artifact");
        self.reused.insert(name.clone());
        self.artifacts.insert(name.clone(), handle.clone());
        self.results.insert(name, BuildResult::Succeeded(handle));
      }
    }
  }

  /// Nodes that must be built: every target plus its bases, up to the first
  /// base with a reused artifact.
  fn needed(&self) -> BTreeSet<String> {
    let mut needed = BTreeSet::new();
    for target in &self.plan.targets {
      let mut current = Some(target.as_str());
      while let Some(name) = current {
        if self.results.contains_key(name) || !needed.insert(name.to_string()) {
          break;
        }
        current = self.plan.graph.base_of(name);
      }
    }
    needed
  }

  /// An existing artifact for a node that is only a dependency of the run.
  fn reusable(&self, name: &str) -> Option<ArtifactHandle> {
    if !self.options.reuse_existing || self.plan.targets.iter().any(|t| t == name) {
      return None;
    }
    let version = &self.plan.specs.get(name)?.version;

    if let Some(known) = self.options.known_artifacts.get(name)
      && known.version.as_ref().is_none_or(|v| v == version)
    {
      return Some(known.handle.clone());
    }
    self.store.get(name, version)
  }

  /// Skip everything built on top of `failed`. Nodes that already have a
  /// result, such as reused artifacts, stop the walk.
  fn skip_dependents(&mut self, failed: &str) {
    let reason = if self.shared.cancel.is_cancelled() {
      SkipReason::Cancelled
    } else {
      SkipReason::DependencyFailed(failed.to_string())
    };
    let mut skipped = BTreeSet::from([failed.to_string()]);
    for dependent in self.plan.graph.dependents_of(failed) {
      let blocked = self.plan.graph.base_of(&dependent).is_some_and(|base| skipped.contains(base));
      if !blocked || self.results.contains_key(&dependent) {
        continue;
      }
      warn!(node = %dependent, reason = %reason, "skipping build");
      skipped.insert(dependent.clone());
      self.results.insert(dependent, BuildResult::Skipped(reason.clone()));
    }
  }

  fn record(&mut self, name: &str, handle: &ArtifactHandle) {
    let Some(spec) = self.plan.specs.get(name) else {
      return;
    };
    self.store.record(&spec.version, handle);
    if let Err(e) = self.store.save() {
      warn!(node = %name, path = %self.store.path().display(), error = %e, "failed to record artifact");
    }
  }
}

/// Build one node: wait for a slot, prepare inputs, run the builder.
async fn build_node<B: ImageBuilder>(
  ctx: Arc<NodeContext<B>>,
  spec: ResolvedSpec,
  base_artifact: Option<ArtifactHandle>,
) -> BuildResult {
  let _permit = tokio::select! {
    permit = ctx.semaphore.acquire() => match permit {
      Ok(permit) => permit,
      Err(_) => return BuildResult::Skipped(SkipReason::Cancelled),
    },
    _ = ctx.cancel.cancelled() => return BuildResult::Skipped(SkipReason::Cancelled),
  };

  match prepare_and_build(&ctx, &spec, base_artifact).await {
    Ok(handle) => BuildResult::Succeeded(handle),
    Err(e) => BuildResult::Failed(e),
  }
}

async fn prepare_and_build<B: ImageBuilder>(
  ctx: &NodeContext<B>,
  spec: &ResolvedSpec,
  base_artifact: Option<ArtifactHandle>,
) -> Result<ArtifactHandle, NodeError> {
  info!(node = %spec.name, version = %spec.version, "building image");

  let archive = match &spec.archive {
    Some(archive) => Some(ctx.archives.get(archive).await?),
    None => None,
  };

  let user_data_file = {
    let dir = ctx.tmp_dir.clone();
    let spec = spec.clone();
    tokio::task::spawn_blocking(move || write_user_data(&dir, &spec))
      .await
      .map_err(|e| NodeError::UserData(e.to_string()))?
      .map_err(|e| NodeError::UserData(e.to_string()))?
  };

  let template = load_template(spec, &ctx.base_dir)?;
  let runtime = RuntimeContext {
    archive,
    base_artifact,
    user_data_file,
  };
  let request = render(spec, &runtime, &template)?;

  let mut attempt = 0;
  loop {
    match ctx.builder.build(&request, &ctx.cancel).await {
      Ok(handle) => return Ok(handle),
      Err(e) if e.is_retryable() && attempt < ctx.retries && !ctx.cancel.is_cancelled() => {
        attempt += 1;
        warn!(
          node = %spec.name,
          attempt,
          retries = ctx.retries,
          error = %e,
          "build attempt failed, retrying"
        );
        tokio::select! {
          _ = tokio::time::sleep(ctx.retry_delay) => {}
          _ = ctx.cancel.cancelled() => return Err(BuildError::Cancelled.into()),
        }
      }
      Err(e) => return Err(e.into()),
    }
  }
}
