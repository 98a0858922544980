use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nodeflow::exec::{ExecFuture, ExecutionError, Executor};
use nodeflow::types::Params;
use serde_json::{Value, json};
use tokio::sync::Notify;

/// What the fake does for one call of a work item.
#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed with this value.
    Ok(Value),
    /// Fail with this message.
    Fail(String),
    /// Sleep, then succeed with the default result.
    Sleep(Duration),
    /// Wait until the notify fires, then succeed with the default result.
    Gate(Arc<Notify>),
    /// Report cancellation.
    Cancelled,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub work_item: String,
    pub params: Params,
    pub at: Instant,
}

#[derive(Default)]
struct Inner {
    started: Mutex<Vec<Invocation>>,
    finished: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    always: Mutex<HashMap<String, Step>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// A fake executor that:
/// - records every invocation (work item, params, time)
/// - plays back scripted steps per work item, one step per call
/// - succeeds with `{"ok": true, "work_item": ...}` once a script runs out
#[derive(Clone, Default)]
pub struct FakeExecutor {
    inner: Arc<Inner>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue steps for the next calls of `work_item`.
    pub fn script(self, work_item: &str, steps: Vec<Step>) -> Self {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(work_item.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Use `step` for every call of `work_item` that has no scripted step.
    pub fn always(self, work_item: &str, step: Step) -> Self {
        self.inner
            .always
            .lock()
            .unwrap()
            .insert(work_item.to_string(), step);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.inner.started.lock().unwrap().clone()
    }

    pub fn calls_for(&self, work_item: &str) -> usize {
        self.inner
            .started
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.work_item == work_item)
            .count()
    }

    /// Work items in the order their calls started.
    pub fn started_order(&self) -> Vec<String> {
        self.inner
            .started
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.work_item.clone())
            .collect()
    }

    /// Work items in the order their calls finished.
    pub fn finished_order(&self) -> Vec<String> {
        self.inner.finished.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, work_item: &str) -> Option<Step> {
        let scripted = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(work_item)
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| self.inner.always.lock().unwrap().get(work_item).cloned())
    }

    async fn call(&self, work_item: &str, params: &Params) -> Result<Value, ExecutionError> {
        self.inner.started.lock().unwrap().push(Invocation {
            work_item: work_item.to_string(),
            params: params.clone(),
            at: Instant::now(),
        });
        let now = self.inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);

        let default = json!({ "ok": true, "work_item": work_item });
        let outcome = match self.next_step(work_item) {
            None => Ok(default),
            Some(Step::Ok(v)) => Ok(v),
            Some(Step::Fail(msg)) => Err(ExecutionError::Failed(msg)),
            Some(Step::Cancelled) => Err(ExecutionError::Cancelled),
            Some(Step::Sleep(d)) => {
                tokio::time::sleep(d).await;
                Ok(default)
            }
            Some(Step::Gate(gate)) => {
                gate.notified().await;
                Ok(default)
            }
        };

        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        self.inner
            .finished
            .lock()
            .unwrap()
            .push(work_item.to_string());
        outcome
    }
}

impl Executor for FakeExecutor {
    fn execute<'a>(&'a self, work_item: &'a str, params: &'a Params) -> ExecFuture<'a> {
        Box::pin(self.call(work_item, params))
    }
}
