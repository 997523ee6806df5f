//! Dependency graph over `base` references.
//!
//! Requested targets are closed over their `base` chains, then ordered so
//! every base comes before the images built on top of it. Among nodes that
//! are ready at the same time, the one pulled in by the earliest requested
//! target goes first, then the lexically smallest name. The order is fully
//! determined by the registry and the target list.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::registry::{ConfigError, Registry};

/// The closure of the requested targets, with an edge from each base to the
/// images that build on it.
#[derive(Debug, Clone)]
pub struct BuildGraph {
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
  /// Index of the first requested target whose closure contains the node.
  rank: HashMap<NodeIndex, usize>,
  order: Vec<String>,
}

impl BuildGraph {
  /// Build the graph for `targets` and compute its build order.
  ///
  /// Fails on unknown targets or bases and on any cycle in the closure,
  /// before anything is built.
  pub fn from_targets<S: AsRef<str>>(registry: &Registry, targets: &[S]) -> Result<Self, ConfigError> {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let mut rank = HashMap::new();
    let mut edges = Vec::new();

    for (target_rank, target) in targets.iter().enumerate() {
      let target = target.as_ref();
      if !registry.contains(target) {
        return Err(ConfigError::UnknownNode(target.to_string()));
      }

      let mut current = target.to_string();
      while !nodes.contains_key(&current) {
        let idx = graph.add_node(current.clone());
        nodes.insert(current.clone(), idx);
        rank.insert(idx, target_rank);

        let Some(base) = registry.get(&current).and_then(|d| d.base.clone()) else {
          break;
        };
        if !registry.contains(&base) {
          return Err(ConfigError::UnknownBase { node: current, base });
        }
        edges.push((base.clone(), current));
        current = base;
      }
    }

    for (base, child) in edges {
      graph.add_edge(nodes[&base], nodes[&child], ());
    }

    let mut dag = Self {
      graph,
      nodes,
      rank,
      order: Vec::new(),
    };
    dag.verify_acyclic()?;
    dag.order = dag.compute_order();
    Ok(dag)
  }

  /// Fail with every node that sits on a cycle.
  fn verify_acyclic(&self) -> Result<(), ConfigError> {
    if toposort(&self.graph, None).is_ok() {
      return Ok(());
    }

    let nodes: BTreeSet<String> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .flatten()
      .map(|idx| self.graph[idx].clone())
      .collect();

    Err(ConfigError::CyclicDependency {
      nodes: nodes.into_iter().collect(),
    })
  }

  /// Kahn's algorithm with a (rank, name) priority among ready nodes.
  fn compute_order(&self) -> Vec<String> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let key = |idx: NodeIndex| Reverse((self.rank[&idx], self.graph[idx].clone(), idx));
    let mut ready: BinaryHeap<_> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(idx, _)| key(*idx))
      .collect();

    let mut order = Vec::with_capacity(self.graph.node_count());
    while let Some(Reverse((_, name, idx))) = ready.pop() {
      order.push(name);
      for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
        let child = edge.target();
        if let Some(degree) = in_degree.get_mut(&child) {
          *degree -= 1;
          if *degree == 0 {
            ready.push(key(child));
          }
        }
      }
    }
    order
  }

  /// Node names, bases before dependents.
  pub fn order(&self) -> &[String] {
    &self.order
  }

  /// The base of `name`, if it has one.
  pub fn base_of(&self, name: &str) -> Option<&str> {
    let idx = *self.nodes.get(name)?;
    self
      .graph
      .neighbors_directed(idx, Direction::Incoming)
      .next()
      .map(|base| self.graph[base].as_str())
  }

  /// Images built directly on `name`, in build order.
  pub fn children_of(&self, name: &str) -> Vec<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let children: BTreeSet<&str> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|child| self.graph[child].as_str())
      .collect();
    self.in_order(children)
  }

  /// Every image that transitively depends on `name`, in build order.
  pub fn dependents_of(&self, name: &str) -> Vec<String> {
    let Some(&start) = self.nodes.get(name) else {
      return Vec::new();
    };

    let mut found = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(idx) = stack.pop() {
      for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        if found.insert(self.graph[child].as_str()) {
          stack.push(child);
        }
      }
    }
    self.in_order(found)
  }

  fn in_order(&self, names: BTreeSet<&str>) -> Vec<String> {
    self
      .order
      .iter()
      .filter(|name| names.contains(name.as_str()))
      .cloned()
      .collect()
  }
}

/// Names to build for `targets`, bases first.
pub fn build_order<S: AsRef<str>>(registry: &Registry, targets: &[S]) -> Result<Vec<String>, ConfigError> {
  Ok(BuildGraph::from_targets(registry, targets)?.order)
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::collections::BTreeMap;

  use proptest::prelude::*;

  use crate::registry::Definition;

  fn registry(entries: &[(&str, Option<&str>)]) -> Registry {
    let definitions: BTreeMap<String, Definition> = entries
      .iter()
      .map(|(name, base)| {
        (
          name.to_string(),
          Definition {
            base: base.map(str::to_string),
            ..Default::default()
          },
        )
      })
      .collect();
    Registry::new(Definition::default(), BTreeMap::new(), definitions).unwrap()
  }

  fn spark() -> Registry {
    registry(&[
      ("base-16.04", None),
      ("spark-master", Some("base-16.04")),
      ("spark-worker", Some("base-16.04")),
      ("zeppelin", Some("spark-master")),
      ("standalone", None),
    ])
  }

  #[test]
  fn bases_are_pulled_in_and_built_first() {
    let order = build_order(&spark(), &["zeppelin"]).unwrap();
    assert_eq!(order, vec!["base-16.04", "spark-master", "zeppelin"]);
  }

  #[test]
  fn ready_nodes_follow_target_order() {
    let order = build_order(&spark(), &["standalone", "spark-worker", "spark-master"]).unwrap();
    assert_eq!(order, vec!["standalone", "base-16.04", "spark-worker", "spark-master"]);

    let order = build_order(&spark(), &["spark-master", "spark-worker", "standalone"]).unwrap();
    assert_eq!(order, vec!["base-16.04", "spark-master", "spark-worker", "standalone"]);
  }

  #[test]
  fn earlier_target_chain_goes_first() {
    let order = build_order(&spark(), &["zeppelin", "spark-worker"]).unwrap();
    assert_eq!(order, vec!["base-16.04", "spark-master", "zeppelin", "spark-worker"]);
  }

  #[test]
  fn duplicate_targets_are_built_once() {
    let order = build_order(&spark(), &["spark-master", "spark-master", "base-16.04"]).unwrap();
    assert_eq!(order, vec!["base-16.04", "spark-master"]);
  }

  #[test]
  fn unknown_target() {
    let result = build_order(&spark(), &["hadoop"]);
    assert!(matches!(result, Err(ConfigError::UnknownNode(n)) if n == "hadoop"));
  }

  #[test]
  fn unknown_base() {
    let registry = registry(&[("a", Some("ghost"))]);
    let result = build_order(&registry, &["a"]);
    assert!(matches!(
      result,
      Err(ConfigError::UnknownBase { node, base }) if node == "a" && base == "ghost"
    ));
  }

  #[test]
  fn cycle_reported_with_members() {
    let registry = registry(&[("a", Some("b")), ("b", Some("c")), ("c", Some("a")), ("d", Some("a"))]);
    let result = build_order(&registry, &["d"]);
    assert!(matches!(
      result,
      Err(ConfigError::CyclicDependency { nodes }) if nodes == vec!["a", "b", "c"]
    ));
  }

  #[test]
  fn self_reference_is_cycle() {
    let registry = registry(&[("a", Some("a"))]);
    assert!(matches!(
      build_order(&registry, &["a"]),
      Err(ConfigError::CyclicDependency { nodes }) if nodes == vec!["a"]
    ));
  }

  #[test]
  fn dependency_queries() {
    let graph = BuildGraph::from_targets(&spark(), &["zeppelin", "spark-worker", "standalone"]).unwrap();
    assert_eq!(graph.base_of("zeppelin"), Some("spark-master"));
    assert_eq!(graph.base_of("base-16.04"), None);
    assert_eq!(graph.children_of("base-16.04"), vec!["spark-master", "spark-worker"]);
    assert_eq!(
      graph.dependents_of("base-16.04"),
      vec!["spark-master", "zeppelin", "spark-worker"]
    );
    assert!(graph.dependents_of("standalone").is_empty());
    assert_eq!(graph.order().len(), 5);
  }

  fn forest() -> impl Strategy<Value = (Vec<Option<usize>>, Vec<usize>)> {
    (1usize..12).prop_flat_map(|n| {
      let bases = (0..n)
        .map(|i| if i == 0 { Just(None).boxed() } else { proptest::option::of(0..i).boxed() })
        .collect::<Vec<_>>();
      (bases, proptest::collection::vec(0..n, 1..=n))
    })
  }

  proptest! {
    #[test]
    fn order_respects_bases_and_closure((bases, targets) in forest()) {
      let names: Vec<String> = (0..bases.len()).map(|i| format!("img-{i:02}")).collect();
      let entries: Vec<(&str, Option<&str>)> = bases
        .iter()
        .enumerate()
        .map(|(i, base)| (names[i].as_str(), base.map(|b| names[b].as_str())))
        .collect();
      let registry = registry(&entries);
      let targets: Vec<&str> = targets.iter().map(|t| names[*t].as_str()).collect();

      let order = build_order(&registry, &targets).unwrap();
      let position: HashMap<&str, usize> =
        order.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();
      prop_assert_eq!(position.len(), order.len());

      for target in &targets {
        let mut current = Some(*target);
        while let Some(name) = current {
          prop_assert!(position.contains_key(name));
          let base = registry.get(name).and_then(|d| d.base.as_deref());
          if let Some(base) = base {
            prop_assert!(position[base] < position[name]);
          }
          current = base;
        }
      }

      prop_assert_eq!(build_order(&registry, &targets).unwrap(), order);
    }
  }
}
