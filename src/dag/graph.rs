// src/dag/graph.rs

use std::collections::HashMap;

use crate::dag::node::Node;
use crate::types::NodeId;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    /// Direct dependencies, deduplicated.
    deps: Vec<NodeId>,
    /// Direct dependents: nodes that depend on this one.
    dependents: Vec<NodeId>,
}

/// In-memory DAG representation keyed by node id.
///
/// Acyclicity and reference checks are done by [`crate::dag::validate`];
/// here we only keep adjacency information for propagation.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<NodeId, DagNode>,
    /// Node ids in submission order.
    order: Vec<NodeId>,
}

impl DagGraph {
    /// Build a DAG from validated nodes.
    ///
    /// Dependencies on ids that are not part of `nodes` are dropped.
    pub fn from_nodes(nodes: &[Node]) -> Self {
        let mut map: HashMap<NodeId, DagNode> = HashMap::new();
        let mut order = Vec::with_capacity(nodes.len());

        for node in nodes {
            let mut deps: Vec<NodeId> = Vec::new();
            for dep in &node.depends_on {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            if map
                .insert(
                    node.id.clone(),
                    DagNode {
                        deps,
                        dependents: Vec::new(),
                    },
                )
                .is_none()
            {
                order.push(node.id.clone());
            }
        }

        // Second pass: drop dangling deps, populate dependents.
        for id in &order {
            let deps = map.get(id).map(|n| n.deps.clone()).unwrap_or_default();
            let mut kept = Vec::with_capacity(deps.len());
            for dep in deps {
                if let Some(dep_node) = map.get_mut(&dep) {
                    dep_node.dependents.push(id.clone());
                    kept.push(dep);
                }
            }
            if let Some(node) = map.get_mut(id) {
                node.deps = kept;
            }
        }

        Self { nodes: map, order }
    }

    /// All node ids, in submission order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Immediate dependencies of a node.
    pub fn dependencies_of(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a node.
    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Nodes without dependencies, in submission order.
    pub fn roots(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.dependencies_of(id).is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_adjacency_and_deduplicates_deps() {
        let nodes = vec![
            Node::new("a", "w"),
            Node::new("b", "w").after("a").after("a"),
            Node::new("c", "w").after("a").after("ghost"),
        ];
        let graph = DagGraph::from_nodes(&nodes);

        assert_eq!(graph.dependencies_of("b"), ["a".to_string()]);
        assert_eq!(graph.dependencies_of("c"), ["a".to_string()]);
        assert_eq!(
            graph.dependents_of("a"),
            ["b".to_string(), "c".to_string()]
        );
        assert_eq!(graph.roots(), vec!["a".to_string()]);
        assert_eq!(graph.len(), 3);
    }
}
