// src/exec/backend.rs

//! Pluggable delegated-executor abstraction.
//!
//! The engine never knows what a work item does; it hands the work item name
//! and the node's effective params to an [`Executor`] and gets back a JSON
//! result or an [`ExecutionError`].
//!
//! - [`crate::exec::CommandExecutor`] is the production implementation that
//!   runs one configured shell command per work item.
//! - [`crate::exec::BlockingExecutor`] wraps a synchronous closure and
//!   offloads it to Tokio's blocking pool.
//! - Tests provide their own implementation that records invocations and
//!   returns scripted outcomes without spawning processes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::types::Params;

/// Why one delegated attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The executor reported an error; the text is used for retry classification.
    #[error("{0}")]
    Failed(String),

    /// The attempt exceeded its per-node timeout and was aborted.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The underlying execution substrate reported cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ExecutionError::Failed(msg.into())
    }
}

/// Boxed future returned by [`Executor::execute`].
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ExecutionError>> + Send + 'a>>;

/// Trait abstracting how a single node attempt is executed.
///
/// Implementations must not block the calling task: real blocking IO belongs
/// in `tokio::process`, `spawn_blocking`, or similar. The engine applies the
/// per-node timeout by dropping the returned future, so implementations that
/// own child processes should make dropping them kill the child.
pub trait Executor: Send + Sync {
    fn execute<'a>(&'a self, work_item: &'a str, params: &'a Params) -> ExecFuture<'a>;
}
