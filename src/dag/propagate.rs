// src/dag/propagate.rs

//! Event-driven dependency tracking for one run.
//!
//! The [`Propagator`] is a pure, synchronous state machine: the run driver
//! feeds it terminal node statuses and gets back which nodes became ready and
//! which were skipped because an ancestor failed. It holds no Tokio types and
//! performs no IO, so it can be unit tested step by step.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::dag::graph::DagGraph;
use crate::types::{NodeId, NodeStatus};

/// Per-node progress as seen by the propagator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Waiting on at least one unresolved dependency.
    Blocked,
    /// Handed to the run driver; executing or about to.
    Scheduled,
    /// Reached a terminal status.
    Resolved(NodeStatus),
}

/// Public, read-only view of a node's propagation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeProgress {
    Blocked,
    Scheduled,
    Resolved(NodeStatus),
}

impl From<Slot> for NodeProgress {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Blocked => NodeProgress::Blocked,
            Slot::Scheduled => NodeProgress::Scheduled,
            Slot::Resolved(s) => NodeProgress::Resolved(s),
        }
    }
}

/// Structured result of feeding one completion into the propagator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationStep {
    /// Nodes whose dependencies are now all resolved; the caller must start them.
    pub newly_ready: Vec<NodeId>,
    /// Transitive dependents of a failed node, now resolved as `Skipped`.
    pub newly_skipped: Vec<NodeId>,
    /// Whether every node in the run is now resolved.
    pub run_finished: bool,
}

#[derive(Debug)]
pub struct Propagator {
    graph: DagGraph,
    slots: HashMap<NodeId, Slot>,
    /// Dependencies each node is still waiting on.
    unmet: HashMap<NodeId, HashSet<NodeId>>,
    resolved: usize,
}

impl Propagator {
    pub fn new(graph: DagGraph) -> Self {
        let mut slots = HashMap::new();
        let mut unmet = HashMap::new();
        for id in graph.node_ids() {
            let deps: HashSet<NodeId> = graph.dependencies_of(id).iter().cloned().collect();
            slots.insert(id.to_string(), Slot::Blocked);
            unmet.insert(id.to_string(), deps);
        }
        Self {
            graph,
            slots,
            unmet,
            resolved: 0,
        }
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    /// Mark every dependency-free node as scheduled and return them.
    ///
    /// Calling this twice returns nothing the second time.
    pub fn start(&mut self) -> Vec<NodeId> {
        let roots = self.graph.roots();
        let mut ready = Vec::with_capacity(roots.len());
        for id in roots {
            if let Some(slot) = self.slots.get_mut(&id) {
                if *slot == Slot::Blocked {
                    *slot = Slot::Scheduled;
                    ready.push(id);
                }
            }
        }
        debug!(?ready, "propagator: initial ready set");
        ready
    }

    /// Nodes that start out waiting on dependencies.
    pub fn initially_waiting(&self) -> Vec<NodeId> {
        self.graph
            .node_ids()
            .filter(|id| !self.graph.dependencies_of(id).is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn progress_of(&self, id: &str) -> Option<NodeProgress> {
        self.slots.get(id).map(|s| (*s).into())
    }

    pub fn is_finished(&self) -> bool {
        self.resolved == self.slots.len()
    }

    /// Feed a terminal status for `node`.
    ///
    /// - A non-blocking status (`success`, `skipped`) removes `node` from its
    ///   dependents' unmet sets and schedules those that have nothing left.
    /// - A blocking status (`failed`, `cancelled`) skips the whole downstream
    ///   subtree without evaluating or executing it.
    pub fn complete(&mut self, node: &str, status: NodeStatus) -> PropagationStep {
        let mut step = PropagationStep::default();

        if !status.is_terminal() {
            warn!(node, %status, "propagator: ignoring non-terminal completion");
            return step;
        }

        match self.slots.get(node).copied() {
            None => {
                warn!(node, "propagator: completion for unknown node; ignoring");
                return step;
            }
            Some(Slot::Resolved(previous)) => {
                warn!(node, %previous, %status, "propagator: node already resolved; ignoring");
                step.run_finished = self.is_finished();
                return step;
            }
            Some(_) => self.resolve(node, status),
        }

        if status.blocks_dependents() {
            self.skip_downstream(node, &mut step.newly_skipped);
        } else {
            self.release_dependents(node, &mut step.newly_ready);
        }

        step.run_finished = self.is_finished();
        step
    }

    fn resolve(&mut self, node: &str, status: NodeStatus) {
        if let Some(slot) = self.slots.get_mut(node) {
            *slot = Slot::Resolved(status);
            self.resolved += 1;
        }
    }

    fn release_dependents(&mut self, node: &str, ready: &mut Vec<NodeId>) {
        let dependents = self.graph.dependents_of(node).to_vec();
        for dependent in dependents {
            let Some(unmet) = self.unmet.get_mut(&dependent) else {
                continue;
            };
            if !unmet.remove(node) || !unmet.is_empty() {
                continue;
            }
            if let Some(slot) = self.slots.get_mut(&dependent) {
                if *slot == Slot::Blocked {
                    *slot = Slot::Scheduled;
                    debug!(node = %dependent, after = node, "propagator: dependencies met");
                    ready.push(dependent);
                }
            }
        }
    }

    fn skip_downstream(&mut self, failed: &str, skipped: &mut Vec<NodeId>) {
        let mut stack: Vec<NodeId> = self.graph.dependents_of(failed).to_vec();
        while let Some(id) = stack.pop() {
            match self.slots.get(&id).copied() {
                Some(Slot::Blocked) => {
                    self.resolve(&id, NodeStatus::Skipped);
                    debug!(node = %id, upstream = failed, "propagator: skipping after upstream failure");
                    stack.extend(self.graph.dependents_of(&id).iter().cloned());
                    skipped.push(id);
                }
                Some(Slot::Scheduled) => {
                    // Cannot happen: a dependent is only scheduled once every
                    // dependency, including `failed`, has resolved.
                    warn!(node = %id, upstream = failed, "propagator: dependent already scheduled");
                }
                Some(Slot::Resolved(_)) | None => {}
            }
        }
    }
}
