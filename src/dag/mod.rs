// src/dag/mod.rs

//! Graph model, validation and dependency propagation.
//!
//! - [`node`] holds the submitted `Node` / `GraphDefinition` types.
//! - [`graph`] holds the adjacency view of a validated graph.
//! - [`validate`] runs the static checks (ids, work items, references, cycles).
//! - [`propagate`] contains the per-run state machine that decides which nodes
//!   become ready and which are skipped when a node reaches a terminal state.

pub mod graph;
pub mod node;
pub mod propagate;
pub mod validate;

pub use graph::DagGraph;
pub use node::{Condition, GraphDefinition, Node};
pub use propagate::{NodeProgress, PropagationStep, Propagator};
pub use validate::{ValidationReport, validate};
