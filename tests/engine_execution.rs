// tests/engine_execution.rs

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use nodeflow::condition::Evaluation;
use nodeflow::dag::{Condition, GraphDefinition, Node};
use nodeflow::engine::{Engine, UPSTREAM_RESULTS_PARAM};
use nodeflow::errors::NodeflowError;
use nodeflow::notify::{BroadcastSink, EventKind, RunEvent};
use nodeflow::store::{ParamPatch, Run};
use nodeflow::types::{NodeStatus, Params, QueueStatus, RunStatus};
use nodeflow_test_utils::{
    FakeExecutor, FakeMutator, Step, chain, diamond, fast_settings, init_tracing, with_timeout,
};

type TestResult = Result<(), Box<dyn Error>>;

const WORK_ITEMS: &[&str] = &["a", "b", "c", "d", "flaky", "slow", "m"];

fn engine_with(executor: &FakeExecutor) -> Engine {
    Engine::builder(fast_settings())
        .work_items(WORK_ITEMS.iter().copied())
        .executor(Arc::new(executor.clone()))
        .build()
        .expect("engine builds")
}

async fn run_to_end(engine: &Engine, nodes: Vec<Node>) -> Result<Run, NodeflowError> {
    let run_id = engine.submit_nodes(nodes, 10)?;
    with_timeout(engine.wait_for_run(&run_id)).await
}

fn status_of(run: &Run, node: &str) -> NodeStatus {
    run.nodes[node].status
}

fn obj(v: Value) -> Params {
    match v {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[tokio::test]
async fn diamond_runs_root_first_and_join_last() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);

    let run = run_to_end(&engine, diamond()).await?;

    let order = exec.started_order();
    assert_eq!(order.len(), 4);
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));
    assert_eq!(run.queue_status, QueueStatus::Done);
    assert_eq!(run.aggregate_status, RunStatus::Done);
    for id in ["a", "b", "c", "d"] {
        assert_eq!(status_of(&run, id), NodeStatus::Success, "node {id}");
        assert_eq!(run.nodes[id].attempts, 1);
    }
    Ok(())
}

#[tokio::test]
async fn join_node_receives_upstream_results() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new()
        .script("b", vec![Step::Ok(json!({"rows": 3}))])
        .script("c", vec![Step::Ok(json!("done"))]);
    let engine = engine_with(&exec);

    run_to_end(&engine, diamond()).await?;

    let d_call = exec
        .invocations()
        .into_iter()
        .find(|i| i.work_item == "d")
        .expect("d was invoked");
    assert_eq!(
        d_call.params[UPSTREAM_RESULTS_PARAM],
        json!({"b": {"rows": 3}, "c": "done"})
    );
    Ok(())
}

#[tokio::test]
async fn terminal_failure_skips_every_descendant() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().always("a", Step::Fail("invalid input".into()));
    let engine = engine_with(&exec);

    let run = run_to_end(&engine, chain(&["a", "b", "c"])).await?;

    assert_eq!(status_of(&run, "a"), NodeStatus::Failed);
    assert_eq!(status_of(&run, "b"), NodeStatus::Skipped);
    assert_eq!(status_of(&run, "c"), NodeStatus::Skipped);
    assert_eq!(exec.calls_for("a"), 1, "non-transient errors are not retried");
    assert_eq!(exec.calls_for("b"), 0);
    assert_eq!(exec.calls_for("c"), 0);
    assert_eq!(run.aggregate_status, RunStatus::Failed);
    assert_eq!(run.nodes["a"].error.as_deref(), Some("invalid input"));
    assert_eq!(run.summary().progress, 100);
    Ok(())
}

#[tokio::test]
async fn identical_work_is_served_from_cache() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);
    let node = || vec![Node::new("a", "a").with_param("x", 1)];

    let first = run_to_end(&engine, node()).await?;
    let second = run_to_end(&engine, node()).await?;

    assert_eq!(exec.calls_for("a"), 1);
    assert!(!first.nodes["a"].cached);
    assert!(second.nodes["a"].cached);
    assert_eq!(second.nodes["a"].result, first.nodes["a"].result);
    let stats = engine.cache_stats().expect("cache enabled");
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
    Ok(())
}

#[tokio::test]
async fn cache_can_be_bypassed_per_node() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);
    let node = || {
        vec![
            Node::new("a", "a")
                .with_param("x", 1)
                .with_param("_cache", false),
        ]
    };

    run_to_end(&engine, node()).await?;
    let second = run_to_end(&engine, node()).await?;

    assert_eq!(exec.calls_for("a"), 2);
    assert!(!second.nodes["a"].cached);
    Ok(())
}

#[tokio::test]
async fn transient_failures_retry_with_growing_backoff() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().script(
        "flaky",
        vec![
            Step::Fail("connection reset".into()),
            Step::Fail("connection reset".into()),
        ],
    );
    let engine = engine_with(&exec);

    let run = run_to_end(&engine, vec![Node::new("n", "flaky")]).await?;

    let state = &run.nodes["n"];
    assert_eq!(state.status, NodeStatus::Success);
    assert_eq!(state.attempts, 3);
    assert_eq!(state.failures, 2);
    assert_eq!(state.param_history.len(), 2);

    let calls = exec.invocations();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1].at - calls[0].at;
    let second_gap = calls[2].at - calls[1].at;
    assert!(first_gap >= Duration::from_millis(10), "{first_gap:?}");
    assert!(second_gap >= Duration::from_millis(20), "{second_gap:?}");
    Ok(())
}

#[tokio::test]
async fn retries_stop_at_the_budget() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().always("flaky", Step::Fail("temporary outage".into()));
    let engine = engine_with(&exec);
    let budget = engine.settings().retry.budget;

    let run = run_to_end(&engine, vec![Node::new("n", "flaky")]).await?;

    assert_eq!(exec.calls_for("flaky"), 1 + budget as usize);
    assert_eq!(run.nodes["n"].status, NodeStatus::Failed);
    assert_eq!(run.nodes["n"].failures, 1 + budget);
    assert_eq!(run.aggregate_status, RunStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn timed_out_attempt_is_retried() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().script("slow", vec![Step::Sleep(Duration::from_secs(5))]);
    let engine = engine_with(&exec);

    let run = run_to_end(&engine, vec![Node::new("n", "slow").with_timeout("50ms")]).await?;

    let state = &run.nodes["n"];
    assert_eq!(state.status, NodeStatus::Success);
    assert_eq!(state.attempts, 2);
    assert_eq!(state.failures, 1);
    Ok(())
}

#[tokio::test]
async fn mutator_patch_is_limited_to_existing_public_keys() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().script("m", vec![Step::Fail("rate limit hit".into())]);
    let mutator = FakeMutator::new().suggest(Evaluation::Ok(obj(json!({
        "batch": 10,
        "extra": true,
        "_cache": false,
    }))));
    let engine = Engine::builder(fast_settings())
        .work_items(WORK_ITEMS.iter().copied())
        .executor(Arc::new(exec.clone()))
        .mutator(Arc::new(mutator.clone()))
        .build()?;

    let node = Node::new("n", "m")
        .with_param("batch", 100)
        .with_param("mode", "fast");
    let run = run_to_end(&engine, vec![node]).await?;

    let state = &run.nodes["n"];
    assert_eq!(state.status, NodeStatus::Success);
    assert_eq!(state.params["batch"], json!(10));
    assert_eq!(state.params["mode"], json!("fast"));
    assert!(!state.params.contains_key("extra"));
    assert!(!state.params.contains_key("_cache"));
    assert_eq!(
        state.param_history,
        vec![ParamPatch {
            retry: 1,
            patch: obj(json!({"batch": 10})),
        }]
    );

    let calls = exec.invocations();
    assert_eq!(calls[0].params["batch"], json!(100));
    assert_eq!(calls[1].params["batch"], json!(10));

    let asked = mutator.calls();
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].node_id, "n");
    assert!(asked[0].error.contains("rate limit"));
    assert_eq!(asked[0].base_params["batch"], json!(100));
    Ok(())
}

#[tokio::test]
async fn failed_mutation_keeps_params_unchanged() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().script("m", vec![Step::Fail("timeout".into())]);
    let mutator = FakeMutator::new().suggest(Evaluation::Failed("no json in reply".into()));
    let engine = Engine::builder(fast_settings())
        .work_items(WORK_ITEMS.iter().copied())
        .executor(Arc::new(exec.clone()))
        .mutator(Arc::new(mutator))
        .build()?;

    let run = run_to_end(&engine, vec![Node::new("n", "m").with_param("batch", 100)]).await?;

    let state = &run.nodes["n"];
    assert_eq!(state.status, NodeStatus::Success);
    assert_eq!(state.params["batch"], json!(100));
    assert_eq!(state.param_history.len(), 1);
    assert!(state.param_history[0].patch.is_empty());
    Ok(())
}

#[tokio::test]
async fn false_condition_skips_node_but_not_its_dependents() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);
    let nodes = vec![
        Node::new("a", "a"),
        Node::new("b", "b")
            .after("a")
            .when(Condition::Expr("up.a.ok == false".into())),
        Node::new("c", "c").after("b"),
    ];

    let run = run_to_end(&engine, nodes).await?;

    assert_eq!(status_of(&run, "b"), NodeStatus::Skipped);
    assert_eq!(exec.calls_for("b"), 0);
    assert_eq!(status_of(&run, "c"), NodeStatus::Success);
    let c_call = exec
        .invocations()
        .into_iter()
        .find(|i| i.work_item == "c")
        .expect("c was invoked");
    assert_eq!(c_call.params[UPSTREAM_RESULTS_PARAM], json!({"b": null}));
    assert_eq!(run.aggregate_status, RunStatus::Done);
    Ok(())
}

#[tokio::test]
async fn literal_false_condition_skips() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);

    let run = run_to_end(&engine, vec![Node::new("a", "a").when(Condition::Bool(false))]).await?;

    assert_eq!(status_of(&run, "a"), NodeStatus::Skipped);
    assert_eq!(exec.calls_for("a"), 0);
    Ok(())
}

#[tokio::test]
async fn broken_condition_fails_open() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);

    let run = run_to_end(
        &engine,
        vec![Node::new("a", "a").when(Condition::Expr("up.(".into()))],
    )
    .await?;

    assert_eq!(status_of(&run, "a"), NodeStatus::Success);
    assert_eq!(exec.calls_for("a"), 1);
    Ok(())
}

#[tokio::test]
async fn cancellation_is_not_retried_and_blocks_dependents() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new().script("a", vec![Step::Cancelled]);
    let engine = engine_with(&exec);

    let run = run_to_end(&engine, chain(&["a", "b"])).await?;

    assert_eq!(status_of(&run, "a"), NodeStatus::Cancelled);
    assert_eq!(status_of(&run, "b"), NodeStatus::Skipped);
    assert_eq!(exec.calls_for("a"), 1);
    assert_eq!(exec.calls_for("b"), 0);
    Ok(())
}

#[tokio::test]
async fn node_concurrency_is_capped_per_run() -> TestResult {
    init_tracing();
    let nap = Step::Sleep(Duration::from_millis(40));
    let exec = FakeExecutor::new()
        .always("a", nap.clone())
        .always("b", nap.clone())
        .always("c", nap.clone())
        .always("d", nap);
    let engine = engine_with(&exec);

    let graph = GraphDefinition {
        priority: None,
        max_concurrency: Some(2),
        nodes: ["a", "b", "c", "d"]
            .iter()
            .map(|id| Node::new(*id, *id))
            .collect(),
    };
    let run_id = engine.submit(graph)?;
    let run = with_timeout(engine.wait_for_run(&run_id)).await?;

    assert_eq!(run.aggregate_status, RunStatus::Done);
    assert!(exec.peak_concurrency() <= 2, "peak {}", exec.peak_concurrency());
    Ok(())
}

#[tokio::test]
async fn invalid_graphs_are_rejected_at_submission() -> TestResult {
    init_tracing();
    let exec = FakeExecutor::new();
    let engine = engine_with(&exec);

    let unknown = engine.submit_nodes(vec![Node::new("a", "nope")], 1);
    assert!(matches!(unknown, Err(NodeflowError::InvalidGraph(_))));

    let cyclic = engine.submit_nodes(
        vec![Node::new("a", "a").after("b"), Node::new("b", "b").after("a")],
        1,
    );
    match cyclic {
        Err(NodeflowError::InvalidGraph(errors)) => {
            assert!(errors.iter().any(|e| e.contains("cycle")), "{errors:?}")
        }
        other => panic!("expected cycle error, got {other:?}"),
    }

    let zero = engine.submit(GraphDefinition {
        priority: None,
        max_concurrency: Some(0),
        nodes: vec![Node::new("a", "a")],
    });
    assert!(matches!(zero, Err(NodeflowError::InvalidGraph(_))));

    assert!(engine.list_runs().is_empty());
    assert_eq!(exec.invocations().len(), 0);
    Ok(())
}

#[tokio::test]
async fn waiting_for_unknown_run_errors() {
    let engine = engine_with(&FakeExecutor::new());
    let res = engine.wait_for_run("missing").await;
    assert!(matches!(res, Err(NodeflowError::RunNotFound(_))));
}

#[tokio::test]
async fn broadcast_sink_sees_run_and_node_lifecycle() -> TestResult {
    init_tracing();
    let sink = BroadcastSink::new(256);
    let mut rx = sink.subscribe();
    let engine = Engine::builder(fast_settings())
        .work_items(WORK_ITEMS.iter().copied())
        .executor(Arc::new(FakeExecutor::new()))
        .sink(Arc::new(sink))
        .build()?;

    let run_id = engine.submit_nodes(chain(&["a", "b"]), 3)?;

    let mut seen = Vec::new();
    with_timeout(async {
        loop {
            let note = rx.recv().await.expect("sink open");
            assert_eq!(note.run_id, run_id);
            let finished = matches!(note.event, EventKind::Run(RunEvent::RunFinished { .. }));
            seen.push(note);
            if finished {
                break;
            }
        }
    })
    .await;

    assert!(matches!(
        seen.first().map(|n| &n.event),
        Some(EventKind::Run(RunEvent::RunStarted { priority: 3 }))
    ));
    assert!(matches!(
        seen.last().map(|n| &n.event),
        Some(EventKind::Run(RunEvent::RunFinished {
            status: RunStatus::Done
        }))
    ));
    let b_statuses: Vec<NodeStatus> = seen
        .iter()
        .filter(|n| n.node_id.as_deref() == Some("b"))
        .filter_map(|n| match &n.event {
            EventKind::Node(e) => Some(e.status),
            EventKind::Run(_) => None,
        })
        .collect();
    assert_eq!(b_statuses.first(), Some(&NodeStatus::Waiting));
    assert_eq!(b_statuses.last(), Some(&NodeStatus::Success));
    assert!(b_statuses.contains(&NodeStatus::Running));
    Ok(())
}

#[tokio::test]
async fn long_running_nodes_publish_progress() -> TestResult {
    init_tracing();
    let sink = BroadcastSink::new(256);
    let mut rx = sink.subscribe();
    let exec = FakeExecutor::new().script("slow", vec![Step::Sleep(Duration::from_millis(120))]);
    let engine = Engine::builder(fast_settings())
        .work_items(WORK_ITEMS.iter().copied())
        .executor(Arc::new(exec))
        .sink(Arc::new(sink))
        .build()?;

    let run_id = engine.submit_nodes(vec![Node::new("n", "slow")], 1)?;
    with_timeout(engine.wait_for_run(&run_id)).await?;

    let mut running = 0;
    while let Ok(note) = rx.try_recv() {
        if let EventKind::Node(e) = note.event {
            if e.status == NodeStatus::Running {
                running += 1;
            }
        }
    }
    assert!(running >= 2, "expected progress updates, saw {running} running events");
    Ok(())
}
