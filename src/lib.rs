// src/lib.rs

pub mod cache;
pub mod cli;
pub mod condition;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod eviction;
pub mod exec;
pub mod logging;
pub mod mutate;
pub mod notify;
pub mod store;
pub mod types;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::dag::GraphDefinition;
use crate::errors::NodeflowError;
use crate::notify::{LogSink, NotificationSink, OutcomeSink};
use crate::types::{DEFAULT_PRIORITY, RunStatus};

pub use crate::engine::EngineBuilder;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - graph loading and validation
/// - the engine (scheduler, drivers, command executor)
/// - Ctrl-C handling
///
/// Prints the run summaries as JSON on stdout and fails if any run failed.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config '{}'", args.config))?;
    debug!(work_items = cfg.work_items.len(), "config loaded");

    let mut graphs = Vec::with_capacity(args.graphs.len());
    for path in &args.graphs {
        let mut graph = read_graph(Path::new(path))?;
        if graph.priority.is_none() {
            graph.priority = args.priority;
        }
        graphs.push((path.as_str(), graph));
    }

    // Final statuses are kept outside the store so eviction cannot hide a
    // failed run from the exit status.
    let outcomes = Arc::new(OutcomeSink::new(LogSink));
    let engine = EngineBuilder::from_config(&cfg)
        .sink(Arc::clone(&outcomes) as Arc<dyn NotificationSink>)
        .build()?;

    let mut problems = Vec::new();
    for (path, graph) in &graphs {
        let report = engine.validate(&graph.nodes);
        problems.extend(report.errors.into_iter().map(|e| format!("{path}: {e}")));
    }
    if !problems.is_empty() {
        bail!("invalid graph definition(s):\n  {}", problems.join("\n  "));
    }

    if args.dry_run {
        print_dry_run(&cfg, &graphs);
        return Ok(());
    }

    let mut run_ids = Vec::with_capacity(graphs.len());
    for (path, graph) in graphs {
        let run_id = engine
            .submit(graph)
            .with_context(|| format!("submitting graph '{path}'"))?;
        info!(run_id = %run_id, graph = path, "graph accepted");
        run_ids.push(run_id);
    }

    let wait_all = async {
        let mut summaries = Vec::with_capacity(run_ids.len());
        for run_id in &run_ids {
            match engine.wait_for_run(run_id).await {
                Ok(run) => summaries.push(run.summary()),
                // Finished and already evicted under `[store].max_finished_runs`.
                Err(NodeflowError::RunNotFound(_)) => {
                    debug!(run_id = %run_id, "run evicted before it was awaited")
                }
                Err(e) => return Err(e),
            }
        }
        Ok::<_, NodeflowError>(summaries)
    };

    let summaries = tokio::select! {
        res = wait_all => res?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; abandoning in-flight runs");
            bail!("interrupted");
        }
    };
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    let failed: Vec<&str> = run_ids
        .iter()
        .filter(|id| {
            // A run without a recorded outcome had its driver abort.
            matches!(outcomes.outcome(id), Some(RunStatus::Failed) | None)
        })
        .map(String::as_str)
        .collect();
    if !failed.is_empty() {
        bail!(
            "{} of {} run(s) failed: {}",
            failed.len(),
            run_ids.len(),
            failed.join(", ")
        );
    }
    Ok(())
}

fn read_graph(path: &Path) -> Result<GraphDefinition> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading graph '{}'", path.display()))?;
    let graph = GraphDefinition::from_json_str(&contents)
        .with_context(|| format!("parsing graph '{}'", path.display()))?;
    Ok(graph)
}

/// Simple dry-run output: print every graph's nodes, deps and commands.
fn print_dry_run(cfg: &ConfigFile, graphs: &[(&str, GraphDefinition)]) {
    println!("nodeflow dry-run");
    println!(
        "  engine.max_parallel_runs = {}",
        cfg.settings.max_parallel_runs
    );
    println!(
        "  engine.node_concurrency = {}",
        cfg.settings.node_concurrency
    );
    println!("  retry.budget = {}", cfg.settings.retry.budget);
    println!();

    for (path, graph) in graphs {
        println!(
            "graph {path} (priority {}, {} nodes):",
            graph.priority.unwrap_or(DEFAULT_PRIORITY),
            graph.nodes.len()
        );
        for node in &graph.nodes {
            println!("  - {} [{}]", node.id, node.work_item);
            if let Some(spec) = cfg.work_items.get(&node.work_item) {
                println!("      cmd: {}", spec.cmd);
            }
            if !node.depends_on.is_empty() {
                println!("      depends_on: {:?}", node.depends_on);
            }
            if let Some(ref condition) = node.condition {
                println!("      condition: {condition:?}");
            }
            if let Some(ref timeout) = node.timeout {
                println!("      timeout: {timeout}");
            }
        }
    }

    debug!("dry-run complete (no execution)");
}
