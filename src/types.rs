// src/types.rs

//! Shared identifiers and lifecycle enums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one submitted graph run.
pub type RunId = String;

/// Identifier of a node, unique within its graph.
pub type NodeId = String;

/// Node parameters: string keys to arbitrary JSON values.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Run priority; lower values are scheduled earlier.
pub type Priority = i64;

/// Priority used when a submission does not specify one.
pub const DEFAULT_PRIORITY: Priority = 100;

/// Lifecycle of one node within one run.
///
/// ```text
/// pending -> waiting -> queued -> running -> success | failed | skipped | cancelled
/// pending -> queued  -> running
/// failed  -> queued               (retry, bounded by the retry budget)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Waiting,
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    /// Whether the node has settled. `Failed` counts as terminal here even
    /// though the executor may still loop it back into `Queued` for a retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }

    /// Terminal states that poison every downstream dependent.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Cancelled)
    }

    /// States counted as "finished" by progress reporting.
    pub fn counts_as_progress(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Skipped | NodeStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler bookkeeping for a run. `Done` does not imply success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Done,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Done => "done",
        };
        f.write_str(s)
    }
}

/// Aggregate status of a run, derived from its node statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Done,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
