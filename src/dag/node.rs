// src/dag/node.rs

//! Node and graph definition types, as submitted by callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::types::{NodeId, Params, Priority};

/// Optional guard deciding whether a node runs at all.
///
/// Either a literal boolean or an expression evaluated against
/// `{ up: <upstream results>, params: <node params> }`
/// (see [`crate::condition`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Bool(bool),
    Expr(String),
}

/// One unit of work in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within its graph.
    pub id: NodeId,

    /// Name of the delegated capability this node invokes.
    #[serde(alias = "script")]
    pub work_item: String,

    #[serde(default)]
    pub params: Params,

    /// Nodes that must reach a terminal state before this one may start.
    #[serde(default)]
    pub depends_on: Vec<NodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Per-node timeout override, e.g. `"30s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, work_item: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            work_item: work_item.into(),
            params: Params::new(),
            depends_on: Vec::new(),
            condition: None,
            timeout: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn after(mut self, dep: impl Into<NodeId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

/// A graph definition file.
///
/// Accepts either a full object or a bare array of nodes:
///
/// ```json
/// { "priority": 5, "max_concurrency": 2, "nodes": [ { "id": "a", "work_item": "fetch" } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Per-run node concurrency override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    pub nodes: Vec<Node>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GraphFile {
    Full(GraphDefinition),
    Nodes(Vec<Node>),
}

impl GraphDefinition {
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self {
            priority: None,
            max_concurrency: None,
            nodes,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let parsed: GraphFile = serde_json::from_str(s)?;
        Ok(match parsed {
            GraphFile::Full(def) => def,
            GraphFile::Nodes(nodes) => Self::from_nodes(nodes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_node_array_with_script_alias() {
        let def = GraphDefinition::from_json_str(
            r#"[{"id": "a", "script": "fetch", "params": {"url": "x"}},
                {"id": "b", "work_item": "parse", "depends_on": ["a"], "condition": "up.a.ok"}]"#,
        )
        .unwrap();

        assert_eq!(def.priority, None);
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[0].work_item, "fetch");
        assert_eq!(
            def.nodes[1].condition,
            Some(Condition::Expr("up.a.ok".to_string()))
        );
    }

    #[test]
    fn parses_full_definition_with_boolean_condition() {
        let def = GraphDefinition::from_json_str(
            r#"{"priority": 3, "max_concurrency": 1,
                "nodes": [{"id": "a", "work_item": "w", "condition": false}]}"#,
        )
        .unwrap();

        assert_eq!(def.priority, Some(3));
        assert_eq!(def.max_concurrency, Some(1));
        assert_eq!(def.nodes[0].condition, Some(Condition::Bool(false)));
    }
}
