// src/store.rs

//! In-memory record of every run and every node's lifecycle.
//!
//! The store is shared by the scheduler, every run driver and every node
//! task. Mutations take the write lock for the duration of one map update;
//! reads clone snapshots under the read lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::dag::Node;
use crate::errors::{NodeflowError, Result};
use crate::eviction::{EvictionPolicy, NoEviction};
use crate::types::{NodeId, NodeStatus, Params, Priority, QueueStatus, RunId, RunStatus};

/// One accepted parameter patch, in the order retries happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamPatch {
    /// Retry number the patch was applied before (1-based).
    pub retry: u32,
    pub patch: Params,
}

/// Mutable lifecycle record of one node in one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeState {
    pub work_item: String,
    pub status: NodeStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds spent running, for the latest attempt.
    pub elapsed: f64,
    pub cached: bool,
    /// Executor invocations plus cache hits.
    pub attempts: u32,
    pub failures: u32,
    /// Effective params of the latest attempt.
    pub params: Params,
    pub param_history: Vec<ParamPatch>,
}

impl NodeState {
    fn new(node: &Node) -> Self {
        Self {
            work_item: node.work_item.clone(),
            status: NodeStatus::Pending,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
            elapsed: 0.0,
            cached: false,
            attempts: 0,
            failures: 0,
            params: node.params.clone(),
            param_history: Vec::new(),
        }
    }
}

/// Partial update applied by [`TaskStateStore::update_node`].
///
/// Fields left as `None` are not touched. `history` is appended.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub status: Option<NodeStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
    pub cached: Option<bool>,
    pub attempts: Option<u32>,
    pub failures: Option<u32>,
    pub params: Option<Params>,
    pub history: Option<ParamPatch>,
}

impl NodeUpdate {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn ended(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = Some(cached);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn failures(mut self, failures: u32) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }

    pub fn history(mut self, entry: ParamPatch) -> Self {
        self.history = Some(entry);
        self
    }

    fn apply(self, state: &mut NodeState) {
        if let Some(s) = self.status {
            state.status = s;
        }
        if let Some(r) = self.result {
            state.result = Some(r);
        }
        if let Some(e) = self.error {
            state.error = Some(e);
        }
        if let Some(t) = self.start_time {
            state.start_time = Some(t);
        }
        if let Some(t) = self.end_time {
            state.end_time = Some(t);
        }
        if let Some(d) = self.elapsed {
            state.elapsed = d.as_secs_f64();
        }
        if let Some(c) = self.cached {
            state.cached = c;
        }
        if let Some(a) = self.attempts {
            state.attempts = a;
        }
        if let Some(f) = self.failures {
            state.failures = f;
        }
        if let Some(p) = self.params {
            state.params = p;
        }
        if let Some(h) = self.history {
            state.param_history.push(h);
        }
    }
}

/// One submitted graph instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: RunId,
    pub priority: Priority,
    /// Submission sequence, used to break priority ties in listings.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub queue_status: QueueStatus,
    pub aggregate_status: RunStatus,
    pub nodes: BTreeMap<NodeId, NodeState>,
}

impl Run {
    /// `failed` if any node failed, `done` if every node succeeded or was
    /// skipped, otherwise the previous value.
    fn recompute_status(&mut self) {
        let statuses = || self.nodes.values().map(|n| n.status);
        if statuses().any(|s| s == NodeStatus::Failed) {
            self.aggregate_status = RunStatus::Failed;
        } else if statuses().all(|s| matches!(s, NodeStatus::Success | NodeStatus::Skipped)) {
            self.aggregate_status = RunStatus::Done;
        }
    }

    pub fn summary(&self) -> RunSummary {
        let total = self.nodes.len();
        let finished = self
            .nodes
            .values()
            .filter(|n| n.status.counts_as_progress())
            .count();
        let progress = if total == 0 {
            0
        } else {
            (finished * 100 / total) as u8
        };
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.aggregate_status,
            queue_status: self.queue_status,
            priority: self.priority,
            progress,
            finished,
            total,
        }
    }
}

/// Row returned by [`TaskStateStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub queue_status: QueueStatus,
    pub priority: Priority,
    /// Percentage of nodes in `success`, `skipped` or `failed`.
    pub progress: u8,
    pub finished: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    runs: HashMap<RunId, Run>,
    next_seq: u64,
    /// Runs whose queue status reached `done`, oldest first.
    finished: VecDeque<(RunId, Instant)>,
}

#[derive(Debug)]
pub struct TaskStateStore {
    inner: RwLock<StoreInner>,
    changed: Notify,
    policy: Arc<dyn EvictionPolicy>,
}

impl Default for TaskStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStateStore {
    /// Store that retains every run for the lifetime of the process.
    pub fn new() -> Self {
        Self::with_policy(Arc::new(NoEviction))
    }

    /// Store that evicts finished runs under `policy`. Queued and running
    /// runs are never evicted.
    pub fn with_policy(policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            changed: Notify::new(),
            policy,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new run with every node `pending` and the run `queued`.
    pub fn init(&self, run_id: &str, nodes: &[Node], priority: Priority) {
        let mut inner = self.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let run = Run {
            run_id: run_id.to_string(),
            priority,
            seq,
            created_at: Utc::now(),
            queue_status: QueueStatus::Queued,
            aggregate_status: RunStatus::Created,
            nodes: nodes
                .iter()
                .map(|n| (n.id.clone(), NodeState::new(n)))
                .collect(),
        };
        inner.runs.insert(run_id.to_string(), run);
        drop(inner);

        debug!(run_id, priority, "store: run initialised");
        self.changed.notify_waiters();
    }

    /// Apply a partial update to one node and recompute the run's aggregate
    /// status. Returns the node's new state.
    pub fn update_node(&self, run_id: &str, node_id: &str, update: NodeUpdate) -> Result<NodeState> {
        let mut inner = self.write();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| NodeflowError::RunNotFound(run_id.to_string()))?;
        let state = run
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NodeflowError::NodeNotFound {
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
            })?;

        update.apply(state);
        let snapshot = state.clone();
        run.recompute_status();
        drop(inner);

        self.changed.notify_waiters();
        Ok(snapshot)
    }

    /// Scheduler bookkeeping. Entering `running` also marks the run itself
    /// as running; reaching `done` makes the run eligible for eviction.
    pub fn set_queue_status(
        &self,
        run_id: &str,
        status: QueueStatus,
        priority: Option<Priority>,
    ) -> Result<()> {
        let mut inner = self.write();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| NodeflowError::RunNotFound(run_id.to_string()))?;

        run.queue_status = status;
        if let Some(p) = priority {
            run.priority = p;
        }
        if status == QueueStatus::Running {
            run.aggregate_status = RunStatus::Running;
        }
        if status == QueueStatus::Done {
            inner.finished.push_back((run_id.to_string(), Instant::now()));
            self.evict_finished(&mut inner);
        }
        drop(inner);

        debug!(run_id, %status, ?priority, "store: queue status updated");
        self.changed.notify_waiters();
        Ok(())
    }

    fn evict_finished(&self, inner: &mut StoreInner) {
        while let Some((oldest, finished_at)) = inner.finished.front() {
            if !self.policy.should_evict(inner.finished.len(), finished_at.elapsed()) {
                break;
            }
            let oldest = oldest.clone();
            inner.finished.pop_front();
            inner.runs.remove(&oldest);
            debug!(run_id = %oldest, "store: finished run evicted");
        }
    }

    /// Snapshot of one run.
    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.read().runs.get(run_id).cloned()
    }

    /// Snapshot of one node.
    pub fn node(&self, run_id: &str, node_id: &str) -> Option<NodeState> {
        self.read()
            .runs
            .get(run_id)
            .and_then(|r| r.nodes.get(node_id))
            .cloned()
    }

    /// Summaries of every retained run, by priority then submission order.
    pub fn list(&self) -> Vec<RunSummary> {
        let inner = self.read();
        let mut runs: Vec<&Run> = inner.runs.values().collect();
        runs.sort_by_key(|r| (r.priority, r.seq));
        runs.into_iter().map(Run::summary).collect()
    }

    /// Resolve once the run's queue status is `done`.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<Run> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get(run_id) {
                None => return Err(NodeflowError::RunNotFound(run_id.to_string())),
                Some(run) if run.queue_status == QueueStatus::Done => return Ok(run),
                Some(_) => {}
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::MaxEntries;
    use serde_json::json;

    fn nodes() -> Vec<Node> {
        vec![Node::new("a", "w"), Node::new("b", "w").after("a")]
    }

    #[test]
    fn aggregate_status_follows_node_statuses() {
        let store = TaskStateStore::new();
        store.init("r", &nodes(), 5);
        assert_eq!(store.get("r").unwrap().aggregate_status, RunStatus::Created);

        store.set_queue_status("r", QueueStatus::Running, None).unwrap();
        assert_eq!(store.get("r").unwrap().aggregate_status, RunStatus::Running);

        store
            .update_node("r", "a", NodeUpdate::status(NodeStatus::Success))
            .unwrap();
        assert_eq!(store.get("r").unwrap().aggregate_status, RunStatus::Running);

        store
            .update_node("r", "b", NodeUpdate::status(NodeStatus::Failed).error("boom"))
            .unwrap();
        assert_eq!(store.get("r").unwrap().aggregate_status, RunStatus::Failed);

        // A retry moves the node on; the aggregate only changes when a rule matches.
        store
            .update_node("r", "b", NodeUpdate::status(NodeStatus::Queued))
            .unwrap();
        assert_eq!(store.get("r").unwrap().aggregate_status, RunStatus::Failed);

        store
            .update_node("r", "b", NodeUpdate::status(NodeStatus::Skipped))
            .unwrap();
        assert_eq!(store.get("r").unwrap().aggregate_status, RunStatus::Done);
    }

    #[test]
    fn partial_updates_touch_only_given_fields() {
        let store = TaskStateStore::new();
        store.init("r", &nodes(), 5);

        store
            .update_node(
                "r",
                "a",
                NodeUpdate::status(NodeStatus::Running).started(Utc::now()),
            )
            .unwrap();
        let state = store
            .update_node(
                "r",
                "a",
                NodeUpdate::default()
                    .result(json!({"ok": true}))
                    .elapsed(Duration::from_millis(1500))
                    .history(ParamPatch {
                        retry: 1,
                        patch: Params::new(),
                    }),
            )
            .unwrap();

        assert_eq!(state.status, NodeStatus::Running);
        assert!(state.start_time.is_some());
        assert_eq!(state.result, Some(json!({"ok": true})));
        assert_eq!(state.elapsed, 1.5);
        assert_eq!(state.param_history.len(), 1);
    }

    #[test]
    fn unknown_run_or_node_is_an_error() {
        let store = TaskStateStore::new();
        store.init("r", &nodes(), 5);
        assert!(matches!(
            store.update_node("nope", "a", NodeUpdate::default()),
            Err(NodeflowError::RunNotFound(_))
        ));
        assert!(matches!(
            store.update_node("r", "zzz", NodeUpdate::default()),
            Err(NodeflowError::NodeNotFound { .. })
        ));
        assert!(store.set_queue_status("nope", QueueStatus::Done, None).is_err());
    }

    #[test]
    fn list_sorts_by_priority_then_submission_and_reports_progress() {
        let store = TaskStateStore::new();
        store.init("late", &nodes(), 1);
        store.init("first", &nodes(), 5);
        store.init("second", &nodes(), 5);
        store
            .update_node("first", "a", NodeUpdate::status(NodeStatus::Failed))
            .unwrap();

        let list = store.list();
        let ids: Vec<&str> = list.iter().map(|s| s.run_id.as_str()).collect();
        assert_eq!(ids, vec!["late", "first", "second"]);
        assert_eq!(list[1].progress, 50);
        assert_eq!(list[1].status, RunStatus::Failed);
        assert_eq!(list[0].progress, 0);
    }

    #[test]
    fn only_finished_runs_are_evicted() {
        let store = TaskStateStore::with_policy(Arc::new(MaxEntries(1)));
        store.init("a", &nodes(), 1);
        store.init("b", &nodes(), 1);
        store.init("c", &nodes(), 1);

        store.set_queue_status("a", QueueStatus::Done, None).unwrap();
        store.set_queue_status("b", QueueStatus::Done, None).unwrap();

        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[tokio::test]
    async fn wait_for_run_resolves_when_done() {
        let store = Arc::new(TaskStateStore::new());
        store.init("r", &nodes(), 1);

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_for_run("r").await })
        };
        tokio::task::yield_now().await;
        store.set_queue_status("r", QueueStatus::Running, None).unwrap();
        store.set_queue_status("r", QueueStatus::Done, None).unwrap();

        let run = waiter.await.unwrap().unwrap();
        assert_eq!(run.queue_status, QueueStatus::Done);
        assert!(store.wait_for_run("missing").await.is_err());
    }
}
