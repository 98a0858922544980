// src/logging.rs

//! Logging setup for `nodeflow` using `tracing` + `tracing-subscriber`.
//!
//! Filter resolution:
//! 1. `--log-level` applies one level to everything.
//! 2. Otherwise `NODEFLOW_LOG` is read as an `EnvFilter` directive list,
//!    e.g. `info,nodeflow::engine::scheduler=debug`.
//! 3. Otherwise `info`.
//!
//! Output goes to stderr; stdout is reserved for the run summary JSON.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "NODEFLOW_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Build the filter for the given CLI level and raw env value.
///
/// An unparseable env value falls back to the default rather than failing
/// startup.
fn build_filter(cli_level: Option<LogLevel>, env_value: Option<&str>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(level.directive());
    }
    env_value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env_value = std::env::var(LOG_ENV).ok();
    let filter = build_filter(cli_level, env_value.as_deref());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("installing tracing subscriber")?;

    Ok(())
}
