// src/mutate.rs

//! Adaptive parameter mutation between retries.
//!
//! After a retryable failure the engine asks a [`ParamMutator`] for a patch
//! to the node's params. Whatever comes back is untrusted: [`sanitize_patch`]
//! keeps only keys already present in the base params, and any failure to
//! produce a patch is treated as an empty patch.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::condition::Evaluation;
use crate::config::MutatorSpec;
use crate::exec::command::run_shell;
use crate::types::Params;

/// Error text sent to the mutator is capped at this many characters.
const MAX_ERROR_CHARS: usize = 2000;

/// Default limit for one mutation command.
const DEFAULT_MUTATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// What the mutator is told about a failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct MutationRequest<'a> {
    pub node_id: &'a str,
    pub error: &'a str,
    /// Snapshot of the whole run at the time of the failure.
    pub run: &'a Value,
    pub base_params: &'a Params,
}

pub type PatchFuture<'a> = Pin<Box<dyn Future<Output = Evaluation<Params>> + Send + 'a>>;

pub trait ParamMutator: Send + Sync {
    fn suggest_patch<'a>(&'a self, request: MutationRequest<'a>) -> PatchFuture<'a>;
}

/// Never suggests anything; retries reuse the same params.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMutation;

impl ParamMutator for NoMutation {
    fn suggest_patch<'a>(&'a self, _request: MutationRequest<'a>) -> PatchFuture<'a> {
        Box::pin(async { Evaluation::Ok(Params::new()) })
    }
}

/// Restrict a suggested patch to keys already present in `base`.
///
/// Private (`_`-prefixed) keys are never patchable. A failed suggestion is
/// an empty patch.
pub fn sanitize_patch(suggestion: Evaluation<Params>, base: &Params) -> Params {
    let raw = match suggestion {
        Evaluation::Ok(raw) => raw,
        Evaluation::Failed(reason) => {
            warn!(%reason, "mutation suggestion failed; using empty patch");
            return Params::new();
        }
    };

    raw.into_iter()
        .filter(|(k, _)| {
            let keep = !k.starts_with('_') && base.contains_key(k);
            if !keep {
                debug!(key = %k, "dropping suggested key not present in params");
            }
            keep
        })
        .collect()
}

/// Parse the JSON object embedded in free-form text: everything from the
/// first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Evaluation<Params> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Evaluation::Failed("no JSON object in mutator output".to_string());
    };
    if end <= start {
        return Evaluation::Failed("no JSON object in mutator output".to_string());
    }

    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Evaluation::Ok(map),
        Ok(_) => Evaluation::Failed("mutator output is not a JSON object".to_string()),
        Err(e) => Evaluation::Failed(format!("unparseable mutator output: {e}")),
    }
}

/// Mutator backed by a shell command.
///
/// The command receives `{"node_id", "error", "base_params", "run"}` as JSON
/// on stdin and should print a JSON object of suggested changes.
#[derive(Debug, Clone)]
pub struct CommandMutator {
    cmd: String,
    timeout: Duration,
}

impl CommandMutator {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            timeout: DEFAULT_MUTATOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_spec(spec: &MutatorSpec) -> Self {
        let mutator = Self::new(spec.cmd.clone());
        match spec.timeout {
            Some(t) => mutator.with_timeout(t),
            None => mutator,
        }
    }

    async fn suggest(&self, request: MutationRequest<'_>) -> Evaluation<Params> {
        let error: String = request.error.chars().take(MAX_ERROR_CHARS).collect();
        let input = json!({
            "node_id": request.node_id,
            "error": error,
            "base_params": Value::Object(request.base_params.clone()),
            "run": request.run,
        });
        let input = match serde_json::to_vec(&input) {
            Ok(bytes) => bytes,
            Err(e) => return Evaluation::Failed(format!("encoding mutator input: {e}")),
        };

        let output = match tokio::time::timeout(self.timeout, run_shell(&self.cmd, &input)).await {
            Err(_) => return Evaluation::Failed(format!("mutator timed out after {:?}", self.timeout)),
            Ok(Err(e)) => return Evaluation::Failed(format!("spawning mutator: {e}")),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Evaluation::Failed(format!(
                "mutator exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        extract_json_object(&String::from_utf8_lossy(&output.stdout))
    }
}

impl ParamMutator for CommandMutator {
    fn suggest_patch<'a>(&'a self, request: MutationRequest<'a>) -> PatchFuture<'a> {
        Box::pin(self.suggest(request))
    }
}

/// Apply a sanitized patch copy-on-write: `base` is left untouched.
pub fn apply_patch(base: &Params, patch: &Params) -> Params {
    let mut next: Map<String, Value> = base.clone();
    for (k, v) in patch {
        next.insert(k.clone(), v.clone());
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn patch_is_restricted_to_existing_public_keys() {
        let base = obj(json!({"timeout": 10, "url": "x", "_cache": true}));
        let suggestion = Evaluation::Ok(obj(
            json!({"timeout": 30, "new_field": 1, "_cache": false, "url": {"nested": true}}),
        ));

        let patch = sanitize_patch(suggestion, &base);
        assert_eq!(patch, obj(json!({"timeout": 30, "url": {"nested": true}})));

        let next = apply_patch(&base, &patch);
        assert_eq!(next["timeout"], json!(30));
        assert_eq!(base["timeout"], json!(10));
    }

    #[test]
    fn failed_suggestion_is_an_empty_patch() {
        let base = obj(json!({"a": 1}));
        assert!(sanitize_patch(Evaluation::Failed("nope".into()), &base).is_empty());
    }

    #[test]
    fn extracts_object_surrounded_by_chatter() {
        let out = "thinking...\n{\"timeout\": 30}\nthat should help";
        assert_eq!(extract_json_object(out), Evaluation::Ok(obj(json!({"timeout": 30}))));

        assert!(extract_json_object("no json here").is_failed());
        assert!(extract_json_object("} backwards {").is_failed());
        assert!(extract_json_object("{not json}").is_failed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_mutator_reads_stdout() {
        let mutator = CommandMutator::new(r#"cat > /dev/null; echo 'sure: {"retries": 5}'"#);
        let base = obj(json!({"retries": 1}));
        let run = json!({});
        let request = MutationRequest {
            node_id: "a",
            error: "timeout",
            run: &run,
            base_params: &base,
        };
        assert_eq!(
            mutator.suggest_patch(request).await,
            Evaluation::Ok(obj(json!({"retries": 5})))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_mutator_failure_is_reported_not_raised() {
        let mutator = CommandMutator::new("exit 1");
        let base = Params::new();
        let run = json!({});
        let request = MutationRequest {
            node_id: "a",
            error: "timeout",
            run: &run,
            base_params: &base,
        };
        assert!(mutator.suggest_patch(request).await.is_failed());
    }
}
