// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::retry::RetryPolicy;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// max_parallel_runs = 2
/// node_concurrency = 4
///
/// [retry]
/// budget = 2
/// base_backoff = "500ms"
///
/// [work_item.fetch]
/// cmd = "./fetch.sh"
/// timeout = "30s"
/// ```
///
/// All sections except `[work_item.<name>]` are optional and have defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub store: StoreSection,

    /// Registered work items, keyed by the name nodes refer to.
    #[serde(default)]
    pub work_item: BTreeMap<String, WorkItemConfig>,

    /// Optional adaptive mutation capability.
    #[serde(default)]
    pub mutator: Option<MutatorConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Process-wide ceiling on simultaneously running graphs.
    #[serde(default = "default_max_parallel_runs")]
    pub max_parallel_runs: usize,

    /// Default per-run ceiling on simultaneously running nodes.
    #[serde(default = "default_node_concurrency")]
    pub node_concurrency: usize,

    /// Optional default per-node timeout (e.g. `"5m"`).
    #[serde(default)]
    pub node_timeout: Option<String>,

    /// Interval at which running nodes re-announce their elapsed time.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: String,
}

fn default_max_parallel_runs() -> usize {
    2
}

fn default_node_concurrency() -> usize {
    4
}

fn default_progress_interval() -> String {
    "1s".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel_runs: default_max_parallel_runs(),
            node_concurrency: default_node_concurrency(),
            node_timeout: None,
            progress_interval: default_progress_interval(),
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Additional attempts allowed after the first one.
    #[serde(default = "default_retry_budget")]
    pub budget: u32,

    /// Backoff before the first retry; doubles on each following retry.
    #[serde(default = "default_base_backoff")]
    pub base_backoff: String,

    /// Case-insensitive substrings marking an error as transient.
    #[serde(default = "default_transient_markers")]
    pub transient_markers: Vec<String>,
}

fn default_retry_budget() -> u32 {
    2
}

fn default_base_backoff() -> String {
    "500ms".to_string()
}

fn default_transient_markers() -> Vec<String> {
    RetryPolicy::default().transient_markers
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            budget: default_retry_budget(),
            base_backoff: default_base_backoff(),
            transient_markers: default_transient_markers(),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of cached results; `0` keeps everything.
    #[serde(default)]
    pub max_entries: usize,
}

fn default_true() -> bool {
    true
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 0,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    /// Maximum number of finished runs retained; `0` keeps everything.
    #[serde(default)]
    pub max_finished_runs: usize,
}

/// `[work_item.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkItemConfig {
    /// Shell command run for each invocation. Params arrive as JSON on stdin.
    pub cmd: String,

    /// Optional timeout overriding `[engine].node_timeout` for this work item.
    #[serde(default)]
    pub timeout: Option<String>,
}

/// `[mutator]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MutatorConfig {
    /// Shell command asked for a parameter patch after a retryable failure.
    pub cmd: String,

    #[serde(default)]
    pub timeout: Option<String>,
}

/// Resolved engine settings.
///
/// This is what the engine consumes; it can be built from a [`ConfigFile`]
/// or constructed directly (tests, embedding).
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_parallel_runs: usize,
    pub node_concurrency: usize,
    pub node_timeout: Option<Duration>,
    pub progress_interval: Duration,
    pub retry: RetryPolicy,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub store_max_finished_runs: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel_runs: default_max_parallel_runs(),
            node_concurrency: default_node_concurrency(),
            node_timeout: None,
            progress_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            cache_enabled: true,
            cache_max_entries: 0,
            store_max_finished_runs: 0,
        }
    }
}

/// A registered work item with its timeout resolved.
#[derive(Debug, Clone)]
pub struct WorkItemSpec {
    pub cmd: String,
    pub timeout: Option<Duration>,
}

/// The mutation command with its timeout resolved.
#[derive(Debug, Clone)]
pub struct MutatorSpec {
    pub cmd: String,
    pub timeout: Option<Duration>,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub settings: EngineSettings,
    pub work_items: BTreeMap<String, WorkItemSpec>,
    pub mutator: Option<MutatorSpec>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        settings: EngineSettings,
        work_items: BTreeMap<String, WorkItemSpec>,
        mutator: Option<MutatorSpec>,
    ) -> Self {
        Self {
            settings,
            work_items,
            mutator,
        }
    }

    /// Names of the registered work items (the capability set).
    pub fn registered_work_items(&self) -> impl Iterator<Item = &str> {
        self.work_items.keys().map(|s| s.as_str())
    }
}
