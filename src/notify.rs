// src/notify.rs

//! Best-effort push of state transitions to observers.
//!
//! Sinks are called synchronously from node tasks, so implementations must
//! return quickly and swallow their own delivery errors.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::store::NodeState;
use crate::types::{NodeId, NodeStatus, Priority, RunId, RunStatus};

/// Snapshot of one node transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeEvent {
    pub status: NodeStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Seconds since the current attempt started.
    pub elapsed: f64,
    pub cached: bool,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl NodeEvent {
    pub fn from_state(state: &NodeState) -> Self {
        Self {
            status: state.status,
            result: state.result.clone(),
            error: state.error.clone(),
            elapsed: state.elapsed,
            cached: state.cached,
            attempt: state.attempts,
            at: Utc::now(),
        }
    }

    /// Same state, elapsed time re-announced by the progress reporter.
    pub fn progress(state: &NodeState, elapsed: f64) -> Self {
        Self {
            elapsed,
            ..Self::from_state(state)
        }
    }
}

/// Run-level lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted { priority: Priority },
    RunFinished { status: RunStatus },
}

pub trait NotificationSink: Send + Sync {
    /// Fire-and-forget delivery of one node transition.
    fn publish(&self, run_id: &str, node_id: &str, event: &NodeEvent);

    /// Fire-and-forget delivery of a run lifecycle event.
    fn publish_run(&self, _run_id: &str, _event: &RunEvent) {}
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _run_id: &str, _node_id: &str, _event: &NodeEvent) {}
}

/// Emits every event as a `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, run_id: &str, node_id: &str, event: &NodeEvent) {
        debug!(
            run_id,
            node = node_id,
            status = %event.status,
            elapsed = event.elapsed,
            cached = event.cached,
            attempt = event.attempt,
            "node event"
        );
    }

    fn publish_run(&self, run_id: &str, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { priority } => info!(run_id, priority, "run started"),
            RunEvent::RunFinished { status } => info!(run_id, %status, "run finished"),
        }
    }
}

/// Payload carried by a [`BroadcastSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventKind {
    Node(NodeEvent),
    Run(RunEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub event: EventKind,
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose events; having no subscribers at all is
/// fine. Neither affects the engine.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    fn send(&self, notification: Notification) {
        // Only fails when nobody is listening.
        let _ = self.tx.send(notification);
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, run_id: &str, node_id: &str, event: &NodeEvent) {
        self.send(Notification {
            run_id: run_id.to_string(),
            node_id: Some(node_id.to_string()),
            event: EventKind::Node(event.clone()),
        });
    }

    fn publish_run(&self, run_id: &str, event: &RunEvent) {
        self.send(Notification {
            run_id: run_id.to_string(),
            node_id: None,
            event: EventKind::Run(event.clone()),
        });
    }
}

/// Remembers the final status of every run that has finished, then forwards
/// every event to `inner`.
///
/// The record lives outside the store, so it survives finished-run eviction.
#[derive(Debug, Default)]
pub struct OutcomeSink<S> {
    inner: S,
    finished: Mutex<HashMap<RunId, RunStatus>>,
}

impl<S: NotificationSink> OutcomeSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            finished: Mutex::new(HashMap::new()),
        }
    }

    /// Final status of a run, or `None` if it has not finished.
    pub fn outcome(&self, run_id: &str) -> Option<RunStatus> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .copied()
    }
}

impl<S: NotificationSink> NotificationSink for OutcomeSink<S> {
    fn publish(&self, run_id: &str, node_id: &str, event: &NodeEvent) {
        self.inner.publish(run_id, node_id, event);
    }

    fn publish_run(&self, run_id: &str, event: &RunEvent) {
        if let RunEvent::RunFinished { status } = event {
            self.finished
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(run_id.to_string(), *status);
        }
        self.inner.publish_run(run_id, event);
    }
}
