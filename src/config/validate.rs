// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{
    ConfigFile, EngineSettings, MutatorSpec, RawConfigFile, WorkItemSpec,
};
use crate::engine::retry::RetryPolicy;
use crate::errors::{NodeflowError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = NodeflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_work_items(&raw)?;
        let settings = resolve_settings(&raw)?;
        let work_items = resolve_work_items(&raw)?;
        let mutator = match &raw.mutator {
            Some(m) => {
                ensure_command("[mutator].cmd", &m.cmd)?;
                Some(MutatorSpec {
                    cmd: m.cmd.clone(),
                    timeout: optional_duration("[mutator].timeout", m.timeout.as_deref())?,
                })
            }
            None => None,
        };
        Ok(ConfigFile::new_unchecked(settings, work_items, mutator))
    }
}

fn ensure_has_work_items(cfg: &RawConfigFile) -> Result<()> {
    if cfg.work_item.is_empty() {
        return Err(NodeflowError::ConfigError(
            "config must contain at least one [work_item.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn resolve_settings(cfg: &RawConfigFile) -> Result<EngineSettings> {
    if cfg.engine.max_parallel_runs == 0 {
        return Err(NodeflowError::ConfigError(
            "[engine].max_parallel_runs must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.engine.node_concurrency == 0 {
        return Err(NodeflowError::ConfigError(
            "[engine].node_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }

    let progress_interval = duration("[engine].progress_interval", &cfg.engine.progress_interval)?;
    if progress_interval.is_zero() {
        return Err(NodeflowError::ConfigError(
            "[engine].progress_interval must be greater than zero".to_string(),
        ));
    }

    let retry = RetryPolicy {
        budget: cfg.retry.budget,
        base_backoff: duration("[retry].base_backoff", &cfg.retry.base_backoff)?,
        transient_markers: cfg
            .retry
            .transient_markers
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect(),
    };

    Ok(EngineSettings {
        max_parallel_runs: cfg.engine.max_parallel_runs,
        node_concurrency: cfg.engine.node_concurrency,
        node_timeout: optional_duration("[engine].node_timeout", cfg.engine.node_timeout.as_deref())?,
        progress_interval,
        retry,
        cache_enabled: cfg.cache.enabled,
        cache_max_entries: cfg.cache.max_entries,
        store_max_finished_runs: cfg.store.max_finished_runs,
    })
}

fn resolve_work_items(cfg: &RawConfigFile) -> Result<BTreeMap<String, WorkItemSpec>> {
    let mut items = BTreeMap::new();
    for (name, item) in cfg.work_item.iter() {
        ensure_command(&format!("[work_item.{name}].cmd"), &item.cmd)?;
        let timeout = optional_duration(
            &format!("[work_item.{name}].timeout"),
            item.timeout.as_deref(),
        )?;
        items.insert(
            name.clone(),
            WorkItemSpec {
                cmd: item.cmd.clone(),
                timeout,
            },
        );
    }
    Ok(items)
}

fn ensure_command(field: &str, cmd: &str) -> Result<()> {
    if cmd.trim().is_empty() {
        return Err(NodeflowError::ConfigError(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| NodeflowError::ConfigError(format!("{field}: {e}")))
}

fn optional_duration(field: &str, value: Option<&str>) -> Result<Option<Duration>> {
    value.map(|v| duration(field, v)).transpose()
}
