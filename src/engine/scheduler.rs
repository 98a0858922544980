// src/engine/scheduler.rs

//! Process-wide priority queue of runs.
//!
//! Entries are ordered by `(priority asc, submission sequence asc)`. A
//! background dispatcher first acquires a slot from the run-concurrency
//! limiter, then pops the best entry and spawns its driver, so while every
//! slot is busy newly submitted runs still compete on priority.
//!
//! `reprioritize` never touches the heap in place: it flags the run id as
//! cancelled and pushes a fresh entry, recording that entry's sequence as the
//! run's latest. A popped entry is discarded only when both hold: its run is
//! flagged and the entry is not the latest. The flag alone is not enough,
//! since a promoted run's fresh entry surfaces before the stale one and must
//! dispatch. The first superseded entry discarded clears the flag.
//!
//! Drivers live outside the heap and are taken exactly once. After two
//! reprioritizations of one queued run, a surviving stale entry can dispatch
//! the run early, but it can never run it twice.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::errors::{NodeflowError, Result};
use crate::store::TaskStateStore;
use crate::types::{Priority, QueueStatus, RunId};

pub type DriverFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Deferred run body, invoked once when the run is dispatched.
pub type RunDriver = Box<dyn FnOnce() -> DriverFuture + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    run_id: RunId,
}

// `BinaryHeap` is a max-heap; invert so the lowest (priority, seq) pops first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// Runs with a superseded entry still in the heap.
    cancelled: HashSet<RunId>,
    /// Sequence number of each queued run's newest entry.
    latest: HashMap<RunId, u64>,
    /// Drivers of runs not yet dispatched.
    pending: HashMap<RunId, RunDriver>,
    next_seq: u64,
}

impl QueueState {
    fn push(&mut self, run_id: &str, priority: Priority) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            priority,
            seq,
            run_id: run_id.to_string(),
        });
        self.latest.insert(run_id.to_string(), seq);
        seq
    }

    /// Pop entries until one can be dispatched.
    fn pop_dispatchable(&mut self) -> Option<(QueueEntry, RunDriver)> {
        while let Some(entry) = self.heap.pop() {
            let superseded = self.latest.get(&entry.run_id) != Some(&entry.seq);
            if superseded && self.cancelled.remove(&entry.run_id) {
                debug!(
                    run_id = %entry.run_id,
                    priority = entry.priority,
                    seq = entry.seq,
                    "scheduler: discarding superseded queue entry"
                );
                continue;
            }

            let Some(driver) = self.pending.remove(&entry.run_id) else {
                debug!(
                    run_id = %entry.run_id,
                    seq = entry.seq,
                    "scheduler: run already dispatched; dropping entry"
                );
                continue;
            };
            self.latest.remove(&entry.run_id);
            return Some((entry, driver));
        }
        None
    }
}

pub struct GlobalScheduler {
    state: Mutex<QueueState>,
    wakeup: Notify,
    run_limiter: Arc<Semaphore>,
    max_parallel_runs: usize,
    store: Arc<TaskStateStore>,
    started: AtomicBool,
}

impl std::fmt::Debug for GlobalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalScheduler")
            .field("max_parallel_runs", &self.max_parallel_runs)
            .field("queued", &self.queued_len())
            .finish_non_exhaustive()
    }
}

impl GlobalScheduler {
    pub fn new(max_parallel_runs: usize, store: Arc<TaskStateStore>) -> Self {
        let max_parallel_runs = max_parallel_runs.max(1);
        Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            run_limiter: Arc::new(Semaphore::new(max_parallel_runs)),
            max_parallel_runs,
            store,
            started: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_parallel_runs(&self) -> usize {
        self.max_parallel_runs
    }

    /// Runs submitted but not yet dispatched.
    pub fn queued_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Enqueue a run. The dispatcher is started on first use and must be
    /// running inside a Tokio runtime.
    pub fn submit(self: &Arc<Self>, run_id: &str, priority: Priority, driver: RunDriver) -> Result<()> {
        self.ensure_started()?;

        let seq = {
            let mut state = self.lock();
            state.pending.insert(run_id.to_string(), driver);
            state.push(run_id, priority)
        };

        if let Err(e) = self
            .store
            .set_queue_status(run_id, QueueStatus::Queued, Some(priority))
        {
            warn!(run_id, error = %e, "scheduler: could not record queued status");
        }
        info!(run_id, priority, seq, "run queued");
        self.wakeup.notify_one();
        Ok(())
    }

    /// Move a still-queued run to `new_priority`.
    ///
    /// Returns `false` (and changes nothing) if the run is not waiting in the
    /// queue, e.g. because it was already dispatched.
    pub fn reprioritize(&self, run_id: &str, new_priority: Priority) -> bool {
        let seq = {
            let mut state = self.lock();
            if !state.pending.contains_key(run_id) {
                return false;
            }
            state.cancelled.insert(run_id.to_string());
            state.push(run_id, new_priority)
        };

        if let Err(e) = self
            .store
            .set_queue_status(run_id, QueueStatus::Queued, Some(new_priority))
        {
            warn!(run_id, error = %e, "scheduler: could not record new priority");
        }
        info!(run_id, priority = new_priority, seq, "run reprioritized");
        self.wakeup.notify_one();
        true
    }

    fn ensure_started(self: &Arc<Self>) -> Result<()> {
        if self.started.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            NodeflowError::Other(anyhow::anyhow!("scheduler needs a Tokio runtime: {e}"))
        })?;
        if self
            .started
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
        {
            handle.spawn(Arc::clone(self).dispatch_loop());
        }
        Ok(())
    }

    async fn next_dispatchable(&self) -> (QueueEntry, RunDriver) {
        loop {
            let notified = self.wakeup.notified();
            let found = self.lock().pop_dispatchable();
            if let Some(found) = found {
                return found;
            }
            notified.await;
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        info!(
            max_parallel_runs = self.max_parallel_runs,
            "scheduler dispatcher started"
        );

        loop {
            let permit = match Arc::clone(&self.run_limiter).acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    info!("run limiter closed; dispatcher exiting");
                    return;
                }
            };

            let (entry, driver) = self.next_dispatchable().await;
            let run_id = entry.run_id;

            if let Err(e) =
                self.store
                    .set_queue_status(&run_id, QueueStatus::Running, Some(entry.priority))
            {
                warn!(run_id = %run_id, error = %e, "scheduler: could not record running status");
            }
            info!(run_id = %run_id, priority = entry.priority, "dispatching run");

            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = tokio::spawn(driver()).await {
                    error!(run_id = %run_id, error = %e, "run driver aborted");
                }
                if let Err(e) = store.set_queue_status(&run_id, QueueStatus::Done, None) {
                    debug!(run_id = %run_id, error = %e, "scheduler: run gone before completion");
                }
                debug!(run_id = %run_id, "run slot released");
            });
        }
    }
}
