// src/exec/command.rs

//! Shell-command executor used in production.
//!
//! Each registered work item maps to one shell command. The node's params
//! (including `_upstream_results`) are written to the child's stdin as JSON;
//! the child prints its result on stdout.

use std::collections::BTreeMap;
use std::process::{Output, Stdio};

use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ConfigFile, WorkItemSpec};
use crate::exec::backend::{ExecFuture, ExecutionError, Executor};
use crate::types::Params;

/// Run `cmd` through the platform shell, feed `input` on stdin and collect
/// the output.
///
/// The child is killed if the returned future is dropped (timeouts).
pub(crate) async fn run_shell(cmd: &str, input: &[u8]) -> std::io::Result<Output> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdin = child.stdin.take();

    let write = async move {
        if let Some(mut stdin) = stdin {
            // A child that never reads stdin closes the pipe early; that is
            // not an error for us.
            if let Err(e) = stdin.write_all(input).await {
                debug!(error = %e, "child did not consume stdin");
            }
            let _ = stdin.shutdown().await;
        }
    };

    let ((), output) = tokio::join!(write, child.wait_with_output());
    output
}

/// Interpret stdout: a JSON document is returned as is, anything else is
/// wrapped as `{"stdout": "..."}`.
fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "stdout": trimmed }))
}

/// Executor that runs one configured shell command per work item.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    work_items: BTreeMap<String, WorkItemSpec>,
}

impl CommandExecutor {
    pub fn new(work_items: BTreeMap<String, WorkItemSpec>) -> Self {
        Self { work_items }
    }

    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self::new(cfg.work_items.clone())
    }

    async fn run(&self, work_item: &str, params: &Params) -> Result<Value, ExecutionError> {
        let spec = self.work_items.get(work_item).ok_or_else(|| {
            ExecutionError::failed(format!("no command registered for work item '{work_item}'"))
        })?;

        let input = serde_json::to_vec(params)
            .map_err(|e| ExecutionError::failed(format!("encoding params: {e}")))?;

        info!(work_item, cmd = %spec.cmd, "starting work item process");

        let output = run_shell(&spec.cmd, &input).await.map_err(|e| {
            ExecutionError::failed(format!("spawning process for work item '{work_item}': {e}"))
        })?;

        let code = output.status.code().unwrap_or(-1);
        if output.status.success() {
            debug!(work_item, exit_code = code, "work item process exited");
            return Ok(parse_stdout(&output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        warn!(work_item, exit_code = code, stderr = %stderr, "work item process failed");
        Err(ExecutionError::failed(if stderr.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {stderr}")
        }))
    }
}

impl Executor for CommandExecutor {
    fn execute<'a>(&'a self, work_item: &'a str, params: &'a Params) -> ExecFuture<'a> {
        Box::pin(self.run(work_item, params))
    }
}
