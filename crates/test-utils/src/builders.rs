#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use nodeflow::config::{
    CacheSection, ConfigFile, EngineSection, EngineSettings, MutatorConfig, RawConfigFile,
    RetrySection, StoreSection, WorkItemConfig,
};
use nodeflow::dag::Node;
use nodeflow::engine::RetryPolicy;

/// Engine settings tuned for tests: tiny backoff and progress interval,
/// everything else at its default.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        progress_interval: Duration::from_millis(20),
        retry: RetryPolicy {
            base_backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
        ..EngineSettings::default()
    }
}

/// `a -> b, a -> c, b -> d, c -> d`, each node using the work item named
/// after it.
pub fn diamond() -> Vec<Node> {
    vec![
        Node::new("a", "a"),
        Node::new("b", "b").after("a"),
        Node::new("c", "c").after("a"),
        Node::new("d", "d").after("b").after("c"),
    ]
}

/// Linear chain over `ids`, each node using the work item named after it.
pub fn chain(ids: &[&str]) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let mut node = Node::new(*id, *id);
        if i > 0 {
            node = node.after(ids[i - 1]);
        }
        nodes.push(node);
    }
    nodes
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                engine: EngineSection::default(),
                retry: RetrySection::default(),
                cache: CacheSection::default(),
                store: StoreSection::default(),
                work_item: BTreeMap::new(),
                mutator: None,
            },
        }
    }

    pub fn with_work_item(mut self, name: &str, cmd: &str) -> Self {
        self.config.work_item.insert(
            name.to_string(),
            WorkItemConfig {
                cmd: cmd.to_string(),
                timeout: None,
            },
        );
        self
    }

    pub fn with_work_item_timeout(mut self, name: &str, cmd: &str, timeout: &str) -> Self {
        self.config.work_item.insert(
            name.to_string(),
            WorkItemConfig {
                cmd: cmd.to_string(),
                timeout: Some(timeout.to_string()),
            },
        );
        self
    }

    pub fn with_mutator(mut self, cmd: &str) -> Self {
        self.config.mutator = Some(MutatorConfig {
            cmd: cmd.to_string(),
            timeout: None,
        });
        self
    }

    pub fn max_parallel_runs(mut self, n: usize) -> Self {
        self.config.engine.max_parallel_runs = n;
        self
    }

    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.config.retry.budget = budget;
        self
    }

    pub fn base_backoff(mut self, backoff: &str) -> Self {
        self.config.retry.base_backoff = backoff.to_string();
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
