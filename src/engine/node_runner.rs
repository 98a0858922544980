// src/engine/node_runner.rs

//! Execution of one node within a run.
//!
//! ```text
//! condition ──false──▶ skipped
//!     │ true (or failed to evaluate)
//!     ▼
//! acquire node slot ──▶ running ──cache hit──▶ success (cached)
//!     ▲                    │
//!     │                    ▼ execute (with timeout)
//!     │               ok ──▶ success
//!     │               err ─▶ failed ──retryable & budget left──▶ backoff, mutate, queued ─┐
//!     └───────────────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::condition::{self, Evaluation};
use crate::dag::Node;
use crate::exec::ExecutionError;
use crate::mutate::{MutationRequest, apply_patch, sanitize_patch};
use crate::notify::NodeEvent;
use crate::store::{NodeUpdate, ParamPatch};
use crate::types::{NodeStatus, Params, RunId};

use super::EngineShared;

/// Private param carrying dependency results into the executor.
pub const UPSTREAM_RESULTS_PARAM: &str = "_upstream_results";

/// Terminal result of [`run_node`], fed back into the run driver.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub result: Option<Value>,
}

impl NodeOutcome {
    fn settled(status: NodeStatus) -> Self {
        Self {
            status,
            result: None,
        }
    }
}

/// Everything one node execution needs from its run.
pub(crate) struct NodeTask {
    pub run_id: RunId,
    pub node: Node,
    /// Dependency id to result (`null` for skipped dependencies).
    pub upstream: Map<String, Value>,
    pub limiter: Arc<Semaphore>,
    pub timeout: Option<Duration>,
}

/// Writes node updates to the store and forwards them to the sink.
struct Recorder<'a> {
    shared: &'a EngineShared,
    run_id: &'a str,
    node_id: &'a str,
}

impl Recorder<'_> {
    fn record(&self, update: NodeUpdate) {
        match self.shared.store.update_node(self.run_id, self.node_id, update) {
            Ok(state) => {
                self.shared
                    .sink
                    .publish(self.run_id, self.node_id, &NodeEvent::from_state(&state));
            }
            Err(e) => {
                warn!(run_id = self.run_id, node = self.node_id, error = %e, "could not record node update");
            }
        }
    }
}

/// Re-announces elapsed time while an attempt is running. Stops when dropped.
struct ProgressReporter(JoinHandle<()>);

impl ProgressReporter {
    fn spawn(shared: Arc<EngineShared>, run_id: &str, node_id: &str, started: Instant) -> Self {
        let run_id = run_id.to_string();
        let node_id = node_id.to_string();
        let interval = shared
            .settings
            .progress_interval
            .max(Duration::from_millis(1));

        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = shared.store.node(&run_id, &node_id) else {
                    break;
                };
                if state.status != NodeStatus::Running {
                    break;
                }
                let event = NodeEvent::progress(&state, started.elapsed().as_secs_f64());
                shared.sink.publish(&run_id, &node_id, &event);
            }
        }))
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one node to a terminal status.
pub(crate) async fn run_node(task: NodeTask, shared: Arc<EngineShared>) -> NodeOutcome {
    let NodeTask {
        run_id,
        node,
        upstream,
        limiter,
        timeout,
    } = task;
    let recorder = Recorder {
        shared: &shared,
        run_id: &run_id,
        node_id: &node.id,
    };

    // Condition: evaluated once. A broken expression must not stall the run,
    // so evaluation failures count as satisfied.
    let evaluation = condition::evaluate(node.condition.as_ref(), &upstream, &node.params);
    if let Evaluation::Failed(reason) = &evaluation {
        warn!(run_id = %run_id, node = %node.id, %reason, "condition evaluation failed; running node anyway");
    }
    if !evaluation.unwrap_or(true) {
        info!(run_id = %run_id, node = %node.id, "condition not met; skipping node");
        recorder.record(
            NodeUpdate::status(NodeStatus::Skipped)
                .elapsed(Duration::ZERO)
                .ended(Utc::now()),
        );
        return NodeOutcome::settled(NodeStatus::Skipped);
    }

    let retry = &shared.settings.retry;
    let mut params: Arc<Params> = Arc::new(node.params.clone());
    let mut attempts = 0u32;
    let mut failures = 0u32;

    loop {
        let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
            warn!(run_id = %run_id, node = %node.id, "node limiter closed; cancelling node");
            recorder.record(NodeUpdate::status(NodeStatus::Cancelled).ended(Utc::now()));
            return NodeOutcome::settled(NodeStatus::Cancelled);
        };

        attempts += 1;
        let started = Instant::now();
        recorder.record(
            NodeUpdate::status(NodeStatus::Running)
                .started(Utc::now())
                .attempts(attempts)
                .cached(false)
                .params(params.as_ref().clone()),
        );
        debug!(run_id = %run_id, node = %node.id, work_item = %node.work_item, attempt = attempts, "node running");
        let progress = ProgressReporter::spawn(Arc::clone(&shared), &run_id, &node.id, started);

        if let Some(hit) = shared
            .cache
            .as_ref()
            .and_then(|cache| cache.lookup(&node.work_item, &params))
        {
            drop(progress);
            info!(run_id = %run_id, node = %node.id, "node served from cache");
            recorder.record(
                NodeUpdate::status(NodeStatus::Success)
                    .result(hit.clone())
                    .cached(true)
                    .elapsed(started.elapsed())
                    .ended(Utc::now()),
            );
            return NodeOutcome {
                status: NodeStatus::Success,
                result: Some(hit),
            };
        }

        let mut exec_params = params.as_ref().clone();
        exec_params.insert(
            UPSTREAM_RESULTS_PARAM.to_string(),
            Value::Object(upstream.clone()),
        );
        let execution = shared.executor.execute(&node.work_item, &exec_params);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .unwrap_or(Err(ExecutionError::Timeout(limit))),
            None => execution.await,
        };

        drop(progress);
        drop(permit);
        let elapsed = started.elapsed();

        let err = match outcome {
            Ok(value) => {
                if let Some(cache) = &shared.cache {
                    cache.store(&node.work_item, &params, value.clone());
                }
                info!(run_id = %run_id, node = %node.id, attempt = attempts, elapsed = ?elapsed, "node succeeded");
                recorder.record(
                    NodeUpdate::status(NodeStatus::Success)
                        .result(value.clone())
                        .elapsed(elapsed)
                        .ended(Utc::now()),
                );
                return NodeOutcome {
                    status: NodeStatus::Success,
                    result: Some(value),
                };
            }
            Err(err) => err,
        };

        if err == ExecutionError::Cancelled {
            warn!(run_id = %run_id, node = %node.id, "node execution cancelled");
            recorder.record(
                NodeUpdate::status(NodeStatus::Cancelled)
                    .error(err.to_string())
                    .elapsed(elapsed)
                    .ended(Utc::now()),
            );
            return NodeOutcome::settled(NodeStatus::Cancelled);
        }

        failures += 1;
        let message = err.to_string();
        recorder.record(
            NodeUpdate::status(NodeStatus::Failed)
                .error(message.clone())
                .failures(failures)
                .elapsed(elapsed)
                .ended(Utc::now()),
        );

        if !retry.allows_retry(failures) || !retry.is_retryable(&err) {
            error!(run_id = %run_id, node = %node.id, attempt = attempts, error = %message, "node failed");
            return NodeOutcome::settled(NodeStatus::Failed);
        }

        let backoff = retry.backoff(failures);
        warn!(
            run_id = %run_id,
            node = %node.id,
            attempt = attempts,
            error = %message,
            backoff = ?backoff,
            "retryable failure; backing off"
        );
        tokio::time::sleep(backoff).await;

        let snapshot = shared
            .store
            .get(&run_id)
            .and_then(|run| serde_json::to_value(run).ok())
            .unwrap_or(Value::Null);
        let suggestion = shared
            .mutator
            .suggest_patch(MutationRequest {
                node_id: &node.id,
                error: &message,
                run: &snapshot,
                base_params: &params,
            })
            .await;
        let patch = sanitize_patch(suggestion, &params);
        if !patch.is_empty() {
            debug!(run_id = %run_id, node = %node.id, ?patch, "applying parameter patch");
            params = Arc::new(apply_patch(&params, &patch));
        }

        recorder.record(
            NodeUpdate::status(NodeStatus::Queued)
                .params(params.as_ref().clone())
                .history(ParamPatch {
                    retry: failures,
                    patch,
                }),
        );
    }
}
