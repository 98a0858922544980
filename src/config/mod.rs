// src/config/mod.rs

//! Configuration loading and validation for nodeflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants and resolve durations (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{load_and_validate, load_from_path, load_from_str};
pub use model::{
    CacheSection, ConfigFile, EngineSection, EngineSettings, MutatorConfig, MutatorSpec,
    RawConfigFile, RetrySection, StoreSection, WorkItemConfig, WorkItemSpec,
};
