// tests/scheduler_priority.rs

use std::error::Error;
use std::sync::Arc;

use tokio::sync::Notify;

use nodeflow::config::EngineSettings;
use nodeflow::dag::Node;
use nodeflow::engine::Engine;
use nodeflow::errors::NodeflowError;
use nodeflow::types::{QueueStatus, RunId};
use nodeflow_test_utils::{
    FakeExecutor, Step, fast_settings, init_tracing, wait_until, with_timeout,
};

type TestResult = Result<(), Box<dyn Error>>;

/// One run slot, occupied by a "block" run until `gate` is notified.
struct Blocked {
    engine: Engine,
    exec: FakeExecutor,
    gate: Arc<Notify>,
    blocker: RunId,
}

async fn blocked_engine() -> Result<Blocked, Box<dyn Error>> {
    let gate = Arc::new(Notify::new());
    let exec = FakeExecutor::new().script("block", vec![Step::Gate(Arc::clone(&gate))]);
    let settings = EngineSettings {
        max_parallel_runs: 1,
        ..fast_settings()
    };
    let engine = Engine::builder(settings)
        .work_items(["block", "low", "high", "mid"])
        .executor(Arc::new(exec.clone()))
        .build()?;

    let blocker = engine.submit_nodes(vec![Node::new("block", "block")], 0)?;
    let watcher = exec.clone();
    with_timeout(wait_until(|| watcher.calls_for("block") == 1)).await;

    Ok(Blocked {
        engine,
        exec,
        gate,
        blocker,
    })
}

fn single(work_item: &str) -> Vec<Node> {
    vec![Node::new(work_item, work_item)]
}

#[tokio::test]
async fn lower_priority_value_dispatches_first() -> TestResult {
    init_tracing();
    let Blocked {
        engine,
        exec,
        gate,
        blocker,
    } = blocked_engine().await?;

    let low = engine.submit_nodes(single("low"), 5)?;
    let high = engine.submit_nodes(single("high"), 1)?;
    assert_eq!(engine.run(&low).map(|r| r.queue_status), Some(QueueStatus::Queued));

    gate.notify_one();
    for id in [&blocker, &low, &high] {
        with_timeout(engine.wait_for_run(id)).await?;
    }

    assert_eq!(exec.started_order(), vec!["block", "high", "low"]);
    Ok(())
}

#[tokio::test]
async fn reprioritized_run_jumps_ahead() -> TestResult {
    init_tracing();
    let Blocked {
        engine,
        exec,
        gate,
        blocker,
    } = blocked_engine().await?;

    let late = engine.submit_nodes(single("high"), 10)?;
    let early = engine.submit_nodes(single("low"), 5)?;
    assert!(engine.reprioritize(&late, 1)?);
    assert_eq!(engine.run(&late).map(|r| r.priority), Some(1));

    gate.notify_one();
    for id in [&blocker, &late, &early] {
        with_timeout(engine.wait_for_run(id)).await?;
    }

    assert_eq!(exec.started_order(), vec!["block", "high", "low"]);

    // Already dispatched: nothing to move.
    assert!(!engine.reprioritize(&late, 0)?);
    assert!(matches!(
        engine.reprioritize("missing", 0),
        Err(NodeflowError::RunNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn demoting_twice_runs_once_from_intermediate_priority() -> TestResult {
    init_tracing();
    let Blocked {
        engine,
        exec,
        gate,
        blocker,
    } = blocked_engine().await?;

    let twice = engine.submit_nodes(single("high"), 1)?;
    let other = engine.submit_nodes(single("mid"), 7)?;
    assert!(engine.reprioritize(&twice, 5)?);
    assert!(engine.reprioritize(&twice, 10)?);

    gate.notify_one();
    for id in [&blocker, &twice, &other] {
        with_timeout(engine.wait_for_run(id)).await?;
    }

    // The single cancellation flag only discards the priority-1 entry, so
    // the priority-5 entry still dispatches ahead of the priority-7 run.
    assert_eq!(exec.started_order(), vec!["block", "high", "mid"]);
    assert_eq!(exec.calls_for("high"), 1);
    assert_eq!(engine.run(&twice).map(|r| r.priority), Some(5));
    Ok(())
}

#[tokio::test]
async fn runs_beyond_the_ceiling_stay_queued() -> TestResult {
    init_tracing();
    let Blocked {
        engine,
        exec,
        gate,
        blocker,
    } = blocked_engine().await?;

    let waiting = engine.submit_nodes(single("low"), 0)?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(exec.calls_for("low"), 0);
    assert_eq!(
        engine.run(&waiting).map(|r| r.queue_status),
        Some(QueueStatus::Queued)
    );
    assert_eq!(
        engine.run(&blocker).map(|r| r.queue_status),
        Some(QueueStatus::Running)
    );

    gate.notify_one();
    let done = with_timeout(engine.wait_for_run(&waiting)).await?;
    assert_eq!(done.queue_status, QueueStatus::Done);

    let listed: Vec<_> = engine.list_runs().into_iter().map(|s| s.run_id).collect();
    assert_eq!(listed, vec![blocker, waiting]);
    Ok(())
}
