// src/engine/driver.rs

//! Per-run driver: starts root nodes, waits for completions, and feeds them
//! through the [`Propagator`] to release or skip dependents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::parse_duration;
use crate::dag::{DagGraph, Node, Propagator};
use crate::notify::{NodeEvent, RunEvent};
use crate::store::NodeUpdate;
use crate::types::{NodeId, NodeStatus, Priority, RunId, RunStatus};

use super::EngineShared;
use super::node_runner::{NodeOutcome, NodeTask, run_node};

/// A validated run, ready to be driven once dispatched.
pub(crate) struct RunPlan {
    pub run_id: RunId,
    pub priority: Priority,
    pub nodes: Vec<Node>,
    pub node_concurrency: usize,
}

struct ActiveRun {
    run_id: RunId,
    shared: Arc<EngineShared>,
    nodes: HashMap<NodeId, Node>,
    propagator: Propagator,
    limiter: Arc<Semaphore>,
    /// Results of successful nodes, handed to their dependents.
    results: HashMap<NodeId, Value>,
    tasks: JoinSet<NodeOutcome>,
    in_flight: HashMap<tokio::task::Id, NodeId>,
}

impl ActiveRun {
    fn set_status(&self, node_id: &str, update: NodeUpdate) {
        match self.shared.store.update_node(&self.run_id, node_id, update) {
            Ok(state) => self
                .shared
                .sink
                .publish(&self.run_id, node_id, &NodeEvent::from_state(&state)),
            Err(e) => warn!(run_id = %self.run_id, node = node_id, error = %e, "could not record node update"),
        }
    }

    /// Per-node timeout: node override, then work item, then engine default.
    fn timeout_for(&self, node: &Node) -> Option<Duration> {
        node.timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .or_else(|| self.shared.work_item_timeouts.get(&node.work_item).copied())
            .or(self.shared.settings.node_timeout)
    }

    fn spawn_node(&mut self, node_id: NodeId) {
        let Some(node) = self.nodes.get(&node_id).cloned() else {
            warn!(run_id = %self.run_id, node = %node_id, "ready node missing from plan");
            return;
        };

        let upstream: Map<String, Value> = self
            .propagator
            .graph()
            .dependencies_of(&node_id)
            .iter()
            .map(|dep| (dep.clone(), self.results.get(dep).cloned().unwrap_or(Value::Null)))
            .collect();

        self.set_status(&node_id, NodeUpdate::status(NodeStatus::Queued));

        let task = NodeTask {
            run_id: self.run_id.clone(),
            timeout: self.timeout_for(&node),
            node,
            upstream,
            limiter: Arc::clone(&self.limiter),
        };
        let handle = self.tasks.spawn(run_node(task, Arc::clone(&self.shared)));
        self.in_flight.insert(handle.id(), node_id);
    }

    fn on_completed(&mut self, node_id: NodeId, outcome: NodeOutcome) {
        debug!(run_id = %self.run_id, node = %node_id, status = %outcome.status, "node settled");
        if outcome.status == NodeStatus::Success {
            self.results
                .insert(node_id.clone(), outcome.result.unwrap_or(Value::Null));
        }

        let step = self.propagator.complete(&node_id, outcome.status);
        for skipped in step.newly_skipped {
            info!(run_id = %self.run_id, node = %skipped, upstream = %node_id, "skipping node after upstream failure");
            self.set_status(
                &skipped,
                NodeUpdate::status(NodeStatus::Skipped)
                    .elapsed(Duration::ZERO)
                    .ended(Utc::now()),
            );
        }
        for ready in step.newly_ready {
            self.spawn_node(ready);
        }
    }

    async fn drive(mut self) -> RunStatus {
        for id in self.propagator.initially_waiting() {
            self.set_status(&id, NodeUpdate::status(NodeStatus::Waiting));
        }
        for id in self.propagator.start() {
            self.spawn_node(id);
        }

        while let Some(joined) = self.tasks.join_next_with_id().await {
            let (task_id, outcome) = match joined {
                Ok((task_id, outcome)) => (task_id, outcome),
                Err(e) => {
                    let status = if e.is_cancelled() {
                        NodeStatus::Cancelled
                    } else {
                        NodeStatus::Failed
                    };
                    error!(run_id = %self.run_id, error = %e, %status, "node task ended abnormally");
                    let task_id = e.id();
                    if let Some(node_id) = self.in_flight.get(&task_id) {
                        self.set_status(
                            node_id,
                            NodeUpdate::status(status)
                                .error(e.to_string())
                                .ended(Utc::now()),
                        );
                    }
                    (task_id, NodeOutcome { status, result: None })
                }
            };

            let Some(node_id) = self.in_flight.remove(&task_id) else {
                warn!(run_id = %self.run_id, "completion for unknown node task");
                continue;
            };
            self.on_completed(node_id, outcome);
        }

        if !self.propagator.is_finished() {
            warn!(run_id = %self.run_id, "run driver stopped with unresolved nodes");
        }

        self.shared
            .store
            .get(&self.run_id)
            .map(|run| run.aggregate_status)
            .unwrap_or(RunStatus::Failed)
    }
}

/// Drive one run to completion.
pub(crate) async fn drive_run(plan: RunPlan, shared: Arc<EngineShared>) {
    let RunPlan {
        run_id,
        priority,
        nodes,
        node_concurrency,
    } = plan;
    // The run may have been reprioritized while queued.
    let priority = shared
        .store
        .get(&run_id)
        .map_or(priority, |run| run.priority);

    info!(run_id = %run_id, priority, nodes = nodes.len(), node_concurrency, "run started");
    shared
        .sink
        .publish_run(&run_id, &RunEvent::RunStarted { priority });

    let driver = ActiveRun {
        run_id: run_id.clone(),
        shared: Arc::clone(&shared),
        propagator: Propagator::new(DagGraph::from_nodes(&nodes)),
        nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        limiter: Arc::new(Semaphore::new(node_concurrency.max(1))),
        results: HashMap::new(),
        tasks: JoinSet::new(),
        in_flight: HashMap::new(),
    };
    let status = driver.drive().await;

    info!(run_id = %run_id, %status, "run finished");
    shared
        .sink
        .publish_run(&run_id, &RunEvent::RunFinished { status });
}
