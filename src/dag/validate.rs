// src/dag/validate.rs

//! Static graph checks, run once at submission.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;

use crate::config::parse_duration;
use crate::dag::node::Node;
use crate::errors::{NodeflowError, Result};

/// Outcome of [`validate`]: every problem found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(NodeflowError::InvalidGraph(self.errors))
        }
    }

    pub fn has_cycle(&self) -> bool {
        self.errors.iter().any(|e| e.contains("cycle"))
    }
}

/// Validate a graph against the set of registered work items.
///
/// Checks (all accumulated):
/// - the graph has at least one node
/// - node ids are unique
/// - every `work_item` is registered
/// - every dependency exists and is not the node itself
/// - per-node timeouts parse
/// - the dependency graph is acyclic (Kahn's algorithm)
pub fn validate<'a, I>(nodes: &[Node], registered_work_items: I) -> ValidationReport
where
    I: IntoIterator<Item = &'a str>,
{
    let registered: HashSet<&str> = registered_work_items.into_iter().collect();
    let mut errors = Vec::new();

    if nodes.is_empty() {
        errors.push("graph must contain at least one node".to_string());
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut reported_dupes: HashSet<&str> = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id.as_str()) && reported_dupes.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    for node in nodes {
        if !registered.contains(node.work_item.as_str()) {
            errors.push(format!(
                "node '{}' uses unregistered work item '{}'",
                node.id, node.work_item
            ));
        }
        for dep in &node.depends_on {
            if dep == &node.id {
                errors.push(format!("node '{}' depends on itself", node.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "node '{}' depends on unknown node '{}'",
                    node.id, dep
                ));
            }
        }
        if let Some(timeout) = &node.timeout {
            if let Err(e) = parse_duration(timeout) {
                errors.push(format!("node '{}' has invalid timeout: {}", node.id, e));
            }
        }
    }

    if let Some(cycle) = detect_cycle(nodes) {
        errors.push(cycle);
    }

    ValidationReport::from_errors(errors)
}

/// Kahn's algorithm over unique ids and known dependencies.
///
/// Returns an error message naming the cyclic components when fewer nodes
/// can be removed than exist.
fn detect_cycle(nodes: &[Node]) -> Option<String> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        indegree.entry(node.id.as_str()).or_insert(0);
        dependents.entry(node.id.as_str()).or_default();
    }

    let mut edges: HashSet<(&str, &str)> = HashSet::new();
    for node in nodes {
        for dep in &node.depends_on {
            if !indegree.contains_key(dep.as_str()) {
                continue;
            }
            if edges.insert((dep.as_str(), node.id.as_str())) {
                if let Some(list) = dependents.get_mut(dep.as_str()) {
                    list.push(node.id.as_str());
                }
                if let Some(d) = indegree.get_mut(node.id.as_str()) {
                    *d += 1;
                }
            }
        }
    }

    let total = indegree.len();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut removed = 0usize;

    while let Some(current) = ready.pop() {
        removed += 1;
        for &next in dependents.get(current).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.push(next);
                }
            }
        }
    }

    if removed == total {
        return None;
    }

    Some(format!(
        "dependency cycle detected (not a DAG) among nodes: {}",
        describe_cycles(&edges, &indegree)
    ))
}

/// Name the strongly connected components left over after Kahn's pass.
fn describe_cycles(edges: &HashSet<(&str, &str)>, indegree: &HashMap<&str, usize>) -> String {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (&id, &d) in indegree {
        if d > 0 {
            graph.add_node(id);
        }
    }
    for &(from, to) in edges {
        if graph.contains_node(from) && graph.contains_node(to) {
            graph.add_edge(from, to, ());
        }
    }

    let mut components: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|c| c.len() > 1 || graph.contains_edge(c[0], c[0]))
        .map(|mut c| {
            c.sort_unstable();
            c.join(" -> ")
        })
        .collect();
    components.sort();
    components.join("; ")
}
