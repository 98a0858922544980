// src/exec/mod.rs

//! Delegated execution layer.
//!
//! The engine calls an [`Executor`] for every node attempt that is not served
//! from the cache.
//!
//! - [`backend`] defines the `Executor` trait and `ExecutionError`.
//! - [`command`] runs configured shell commands via `tokio::process`.
//! - [`blocking`] adapts synchronous closures with `spawn_blocking`.

pub mod backend;
pub mod blocking;
pub mod command;

pub use backend::{ExecFuture, ExecutionError, Executor};
pub use blocking::BlockingExecutor;
pub use command::CommandExecutor;
