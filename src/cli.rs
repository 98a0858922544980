// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::config::loader::DEFAULT_CONFIG_PATH;
use crate::types::Priority;

/// Command-line arguments for `nodeflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "nodeflow",
    version,
    about = "Run dependency graphs of work items with retries, caching and priorities.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the engine config file (TOML).
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Graph definition file (JSON). May be given multiple times; each graph
    /// becomes an independently scheduled run.
    #[arg(long = "graph", value_name = "PATH", required = true)]
    pub graphs: Vec<String>,

    /// Priority for graphs that do not declare one (lower runs first).
    #[arg(long, value_name = "N")]
    pub priority: Option<Priority>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `NODEFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Validate graphs and print the plan, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_working_directory_file() {
        let args = CliArgs::try_parse_from(["nodeflow", "--graph", "g.json"]).unwrap();
        assert_eq!(args.config, DEFAULT_CONFIG_PATH);
        assert_eq!(args.graphs, vec!["g.json".to_string()]);
        assert!(!args.dry_run);
    }

    #[test]
    fn graph_is_required() {
        assert!(CliArgs::try_parse_from(["nodeflow"]).is_err());
    }
}
