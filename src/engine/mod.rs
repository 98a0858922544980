// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - graph validation at submission
//! - the global run scheduler ([`scheduler`])
//! - the per-run driver and dependency propagation ([`driver`])
//! - per-node execution with cache, timeout, retry and mutation ([`node_runner`])
//!
//! [`Engine`] is the single service object callers hold. It owns the shared
//! store, cache and scheduler; nothing here is global.

pub mod driver;
pub mod node_runner;
pub mod retry;
pub mod scheduler;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{CacheStats, ResultCache};
use crate::config::{ConfigFile, EngineSettings};
use crate::dag::{GraphDefinition, Node, ValidationReport, validate};
use crate::errors::{NodeflowError, Result};
use crate::eviction::policy_for_limit;
use crate::exec::{CommandExecutor, Executor};
use crate::mutate::{CommandMutator, NoMutation, ParamMutator};
use crate::notify::{LogSink, NotificationSink};
use crate::store::{Run, RunSummary, TaskStateStore};
use crate::types::{DEFAULT_PRIORITY, Priority, RunId};

use driver::{RunPlan, drive_run};
use scheduler::{DriverFuture, GlobalScheduler, RunDriver};

pub use node_runner::{NodeOutcome, UPSTREAM_RESULTS_PARAM};
pub use retry::RetryPolicy;

/// State shared by every run driver and node task.
pub(crate) struct EngineShared {
    pub settings: EngineSettings,
    pub store: Arc<TaskStateStore>,
    pub cache: Option<Arc<ResultCache>>,
    pub executor: Arc<dyn Executor>,
    pub mutator: Arc<dyn ParamMutator>,
    pub sink: Arc<dyn NotificationSink>,
    pub work_item_timeouts: HashMap<String, Duration>,
}

pub struct EngineBuilder {
    settings: EngineSettings,
    work_items: BTreeSet<String>,
    work_item_timeouts: HashMap<String, Duration>,
    executor: Option<Arc<dyn Executor>>,
    mutator: Arc<dyn ParamMutator>,
    sink: Arc<dyn NotificationSink>,
}

impl EngineBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            work_items: BTreeSet::new(),
            work_item_timeouts: HashMap::new(),
            executor: None,
            mutator: Arc::new(NoMutation),
            sink: Arc::new(LogSink),
        }
    }

    /// Builder preloaded from a validated config: its work items, their
    /// timeouts, the command executor and the command mutator if configured.
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let mut builder = Self::new(cfg.settings.clone())
            .work_items(cfg.registered_work_items())
            .executor(Arc::new(CommandExecutor::from_config(cfg)));

        for (name, spec) in &cfg.work_items {
            if let Some(timeout) = spec.timeout {
                builder = builder.work_item_timeout(name.clone(), timeout);
            }
        }
        if let Some(spec) = &cfg.mutator {
            builder = builder.mutator(Arc::new(CommandMutator::from_spec(spec)));
        }
        builder
    }

    /// Register a work item name (the capability set checked at validation).
    pub fn work_item(mut self, name: impl Into<String>) -> Self {
        self.work_items.insert(name.into());
        self
    }

    pub fn work_items<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.work_items.extend(names.into_iter().map(Into::into));
        self
    }

    /// Default timeout for every node using `name`.
    pub fn work_item_timeout(mut self, name: impl Into<String>, timeout: Duration) -> Self {
        self.work_item_timeouts.insert(name.into(), timeout);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn mutator(mut self, mutator: Arc<dyn ParamMutator>) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let executor = self
            .executor
            .ok_or_else(|| NodeflowError::ConfigError("engine needs an executor".to_string()))?;

        let settings = self.settings;
        let store = Arc::new(TaskStateStore::with_policy(policy_for_limit(
            settings.store_max_finished_runs,
        )));
        let cache = settings.cache_enabled.then(|| {
            Arc::new(ResultCache::with_policy(policy_for_limit(
                settings.cache_max_entries,
            )))
        });
        let scheduler = Arc::new(GlobalScheduler::new(
            settings.max_parallel_runs,
            Arc::clone(&store),
        ));

        Ok(Engine {
            shared: Arc::new(EngineShared {
                settings,
                store,
                cache,
                executor,
                mutator: self.mutator,
                sink: self.sink,
                work_item_timeouts: self.work_item_timeouts,
            }),
            scheduler,
            work_items: self.work_items,
        })
    }
}

/// Submission and observation API for graph runs.
pub struct Engine {
    shared: Arc<EngineShared>,
    scheduler: Arc<GlobalScheduler>,
    work_items: BTreeSet<String>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("work_items", &self.work_items)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(settings: EngineSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// Engine wired to the command executor and (optional) command mutator
    /// described by a validated config.
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        EngineBuilder::from_config(cfg).build()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    /// Run the static checks against this engine's registered work items.
    pub fn validate(&self, nodes: &[Node]) -> ValidationReport {
        validate(nodes, self.work_items.iter().map(String::as_str))
    }

    /// Validate and enqueue a graph. Returns the new run id immediately;
    /// progress is observed through the sink or the store.
    pub fn submit(&self, graph: GraphDefinition) -> Result<RunId> {
        let GraphDefinition {
            priority,
            max_concurrency,
            nodes,
        } = graph;

        let mut report = self.validate(&nodes);
        if max_concurrency == Some(0) {
            report.ok = false;
            report
                .errors
                .push("max_concurrency must be at least 1".to_string());
        }
        report.into_result()?;

        let priority = priority.unwrap_or(DEFAULT_PRIORITY);
        let run_id = Uuid::new_v4().to_string();
        self.shared.store.init(&run_id, &nodes, priority);

        let plan = RunPlan {
            run_id: run_id.clone(),
            priority,
            node_concurrency: max_concurrency.unwrap_or(self.shared.settings.node_concurrency),
            nodes,
        };
        let shared = Arc::clone(&self.shared);
        let driver: RunDriver = Box::new(move || -> DriverFuture { Box::pin(drive_run(plan, shared)) });

        self.scheduler.submit(&run_id, priority, driver)?;
        info!(run_id = %run_id, priority, "graph submitted");
        Ok(run_id)
    }

    /// Convenience for [`Engine::submit`] with default concurrency.
    pub fn submit_nodes(&self, nodes: Vec<Node>, priority: Priority) -> Result<RunId> {
        self.submit(GraphDefinition {
            priority: Some(priority),
            max_concurrency: None,
            nodes,
        })
    }

    /// Change the priority of a run that is still queued.
    ///
    /// Returns `Ok(false)` if the run exists but was already dispatched.
    pub fn reprioritize(&self, run_id: &str, new_priority: Priority) -> Result<bool> {
        if self.shared.store.get(run_id).is_none() {
            return Err(NodeflowError::RunNotFound(run_id.to_string()));
        }
        let moved = self.scheduler.reprioritize(run_id, new_priority);
        if !moved {
            debug!(run_id, new_priority, "reprioritize ignored; run no longer queued");
        }
        Ok(moved)
    }

    pub fn run(&self, run_id: &str) -> Option<Run> {
        self.shared.store.get(run_id)
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        self.shared.store.list()
    }

    /// Resolve when the run's queue status becomes `done`.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<Run> {
        self.shared.store.wait_for_run(run_id).await
    }

    pub fn store(&self) -> &Arc<TaskStateStore> {
        &self.shared.store
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.shared.cache.as_ref().map(|c| c.stats())
    }
}
