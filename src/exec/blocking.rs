// src/exec/blocking.rs

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::exec::backend::{ExecFuture, ExecutionError, Executor};
use crate::types::Params;

/// Adapter for synchronous executors.
///
/// The closure runs on Tokio's blocking pool so a slow call never stalls the
/// dispatcher or other nodes. A timed-out call keeps its blocking thread
/// until the closure returns; only its result is discarded.
pub struct BlockingExecutor<F> {
    f: Arc<F>,
}

impl<F> BlockingExecutor<F>
where
    F: Fn(&str, &Params) -> Result<Value, String> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F> Executor for BlockingExecutor<F>
where
    F: Fn(&str, &Params) -> Result<Value, String> + Send + Sync + 'static,
{
    fn execute<'a>(&'a self, work_item: &'a str, params: &'a Params) -> ExecFuture<'a> {
        let f = Arc::clone(&self.f);
        let work_item = work_item.to_string();
        let params = params.clone();

        Box::pin(async move {
            match tokio::task::spawn_blocking(move || f(&work_item, &params)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(msg)) => Err(ExecutionError::Failed(msg)),
                Err(e) if e.is_cancelled() => Err(ExecutionError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "blocking executor panicked");
                    Err(ExecutionError::failed(format!("executor panicked: {e}")))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn runs_closure_off_the_async_thread() {
        let exec = BlockingExecutor::new(|work_item: &str, params: &Params| {
            if work_item == "bad" {
                return Err("boom".to_string());
            }
            Ok(json!({ "work_item": work_item, "n": params.len() }))
        });

        let ok = exec.execute("good", &Params::new()).await.unwrap();
        assert_eq!(ok, json!({"work_item": "good", "n": 0}));

        let err = exec.execute("bad", &Params::new()).await.unwrap_err();
        assert_eq!(err, ExecutionError::Failed("boom".into()));
    }
}
