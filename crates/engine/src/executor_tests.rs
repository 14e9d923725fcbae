//! Scenario tests for the workflow execution engine.
//!
//! These drive `WorkflowEngine` over `MemoryStore` and `MemoryQueue` with
//! `MockNode` plugins, so no Postgres connection is required. Tests that
//! involve backoff or delays run on the paused tokio clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

use db::{MemoryStore, Store, models::{RunStatus, StepStatus, StepUpdate}};
use nodes::{DelayNode, NodeError, mock::MockNode};
use queue::{JobQueue, MemoryQueue};

use crate::{
    EngineConfig, EngineError, ExecutionEvent, PluginSet, StepOutcome, ValidationError,
    WorkflowEngine, worker,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    engine: Arc<WorkflowEngine>,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    workflow_id: Uuid,
}

impl Harness {
    async fn new(definition: Value, mock: &MockNode) -> Self {
        Self::with_plugins(definition, PluginSet::uniform(Arc::new(mock.clone()))).await
    }

    async fn with_plugins(definition: Value, plugins: PluginSet) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            queue.clone(),
            plugins,
            EngineConfig::default(),
        ));
        let workflow_id = Uuid::new_v4();
        engine
            .publish_version(workflow_id, "test", definition)
            .await
            .expect("definition should be valid");
        Self { engine, store, queue, workflow_id }
    }

    async fn start(&self, input: Value) -> Uuid {
        self.engine
            .start_execution(self.workflow_id, input, json!({ "user": "tester" }))
            .await
            .unwrap()
    }

    /// Process jobs until the queue is empty, sleeping through delays.
    async fn drain(&self) {
        for _ in 0..1_000 {
            if let Some(job) = self.queue.dequeue().await.unwrap() {
                worker::process(&self.engine, self.queue.as_ref(), job).await;
                continue;
            }
            match self.queue.next_due_in().await {
                Some(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
                None => return,
            }
        }
        panic!("queue did not drain");
    }

    /// Execute exactly one due job.
    async fn step(&self) -> StepOutcome {
        let job = self.queue.dequeue().await.unwrap().expect("a due job");
        let outcome = self.engine.execute_node(&job.job).await.unwrap();
        self.queue.complete(job.id).await.unwrap();
        outcome
    }

    async fn run_status(&self, run_id: Uuid) -> RunStatus {
        self.store.get_run(run_id).await.unwrap().status
    }

    async fn step_statuses(&self, run_id: Uuid) -> BTreeMap<String, StepStatus> {
        self.store
            .list_steps(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.node_id, s.status))
            .collect()
    }
}

fn text(id: &str) -> Value {
    json!({ "id": id, "type": "TEXT_TRANSFORM", "config": { "operation": "uppercase" } })
}

fn linear(ids: &[&str]) -> Value {
    let nodes: Vec<Value> = ids.iter().map(|id| text(id)).collect();
    let edges: Vec<Value> = ids
        .windows(2)
        .map(|w| json!({ "from": w[0], "to": w[1] }))
        .collect();
    json!({ "nodes": nodes, "edges": edges })
}

fn statuses(pairs: &[(&str, StepStatus)]) -> BTreeMap<String, StepStatus> {
    pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
}

// ============================================================
// Happy path
// ============================================================

#[tokio::test]
async fn linear_run_succeeds_after_every_step() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b", "c"]), &mock).await;
    let run_id = h.start(json!({ "text": "hello" })).await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Running);

    h.step().await;
    h.step().await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Running);
    h.step().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_order(), vec!["a", "b", "c"]);
    assert_eq!(
        h.step_statuses(run_id).await,
        statuses(&[("a", StepStatus::Success), ("b", StepStatus::Success), ("c", StepStatus::Success)])
    );

    // Each child receives its single parent's output.
    let b = h.store.get_step(run_id, "b").await.unwrap();
    assert_eq!(b.input, Some(json!({ "node": "a", "input": { "text": "hello" } })));

    let run = h.engine.get_run(run_id).await.unwrap();
    assert!(run.started_at.is_some() && run.completed_at.is_some());
}

#[tokio::test]
async fn fan_in_waits_for_every_parent() {
    // a -> {b, c} -> d
    let def = json!({
        "nodes": [text("a"), text("b"), text("c"), text("d")],
        "edges": [
            { "from": "a", "to": "b" }, { "from": "a", "to": "c" },
            { "from": "b", "to": "d" }, { "from": "c", "to": "d" }
        ]
    });
    let mock = MockNode::new()
        .returning("b", json!({ "left": 1 }))
        .returning("c", json!({ "right": 2 }));
    let h = Harness::new(def, &mock).await;
    let run_id = h.start(json!({})).await;

    h.step().await; // a
    h.step().await; // b
    assert_eq!(h.queue.pending_len().await, 1, "d must wait for c");
    h.step().await; // c
    h.step().await; // d

    let d = h.store.get_step(run_id, "d").await.unwrap();
    assert_eq!(
        d.input,
        Some(json!({ "b": { "node": "b", "left": 1 }, "c": { "node": "c", "right": 2 } }))
    );
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
}

// ============================================================
// Failure and retry
// ============================================================

#[tokio::test]
async fn permanent_failure_fails_the_run_while_siblings_are_pending() {
    // a -> {bad, x}; x -> y
    let def = json!({
        "nodes": [text("a"), text("bad"), text("x"), text("y")],
        "edges": [
            { "from": "a", "to": "bad" }, { "from": "a", "to": "x" }, { "from": "x", "to": "y" }
        ]
    });
    let mock = MockNode::new().failing_permanent("bad", "invalid payload");
    let h = Harness::new(def, &mock).await;
    let run_id = h.start(json!({})).await;

    h.step().await; // a
    let outcome = h.step().await; // bad
    assert_eq!(outcome, StepOutcome::Failed { error: "invalid payload".into() });
    assert_eq!(h.run_status(run_id).await, RunStatus::Failed);

    h.drain().await;
    assert_eq!(mock.call_count("x"), 0);
    assert_eq!(
        h.step_statuses(run_id).await,
        statuses(&[
            ("a", StepStatus::Success),
            ("bad", StepStatus::Failed),
            ("x", StepStatus::Pending),
            ("y", StepStatus::Pending),
        ])
    );

    let bad = h.store.get_step(run_id, "bad").await.unwrap();
    assert_eq!(bad.step_error().unwrap().message, "invalid payload");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_retries_then_fail() {
    let def = json!({
        "nodes": [
            text("a"),
            { "id": "b", "type": "API_PROXY", "config": { "url": "https://api.example.com/" },
              "retryConfig": { "maxAttempts": 3, "backoffMs": 100, "backoffMultiplier": 2.0 } }
        ],
        "edges": [{ "from": "a", "to": "b" }]
    });
    let mock = MockNode::new().failing_transient("b", "network error calling upstream");
    let h = Harness::new(def, &mock).await;
    let run_id = h.start(json!({})).await;

    h.drain().await;

    assert_eq!(mock.call_count("b"), 3);
    assert_eq!(h.run_status(run_id).await, RunStatus::Failed);
    let b = h.store.get_step(run_id, "b").await.unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.retry_count, 2);
    assert!(b.step_error().unwrap().message.contains("network"));
}

#[tokio::test(start_paused = true)]
async fn flaky_step_retries_on_the_same_row() {
    let mock = MockNode::new().flaky(
        "b",
        2,
        NodeError::Transient("request timeout".into()),
        json!({ "ok": true }),
    );
    let h = Harness::new(linear(&["a", "b", "c"]), &mock).await;
    let run_id = h.start(json!({})).await;
    let started = Instant::now();

    h.step().await; // a
    let first = h.step().await; // b, attempt 1
    assert!(matches!(first, StepOutcome::Retrying { retry_count: 1, delay_ms } if (800..=1200).contains(&delay_ms)));
    assert_eq!(
        h.store.get_step(run_id, "b").await.unwrap().status,
        StepStatus::Retrying
    );

    h.drain().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_count("b"), 3);
    // Backoff of ~1000ms then ~2000ms, each within ±20%.
    assert!(started.elapsed() >= Duration::from_millis(2400));

    let steps = h.store.list_steps(run_id).await.unwrap();
    assert_eq!(steps.len(), 3, "retries never create new rows");
    let b = steps.iter().find(|s| s.node_id == "b").unwrap();
    assert_eq!(b.retry_count, 2);
    assert_eq!(b.error, None);
    assert_eq!(b.output, Some(json!({ "node": "b", "ok": true })));
}

#[tokio::test]
async fn http_client_errors_are_not_retried() {
    let mock = MockNode::new().on(
        "b",
        nodes::mock::MockBehaviour::Fail(NodeError::Http { status: 404, message: "missing".into() }),
    );
    let h = Harness::new(linear(&["a", "b"]), &mock).await;
    let run_id = h.start(json!({})).await;

    h.drain().await;
    assert_eq!(mock.call_count("b"), 1);
    assert_eq!(h.run_status(run_id).await, RunStatus::Failed);
}

// ============================================================
// Idempotency
// ============================================================

#[tokio::test]
async fn duplicate_delivery_reuses_the_first_result() {
    let mock = MockNode::new().returning("a", json!({ "value": 42 }));
    let h = Harness::new(linear(&["a", "b"]), &mock).await;
    let run_id = h.start(json!({ "seed": 1 })).await;

    let job = h.queue.dequeue().await.unwrap().unwrap();
    let first = h.engine.execute_node(&job.job).await.unwrap();
    let second = h.engine.execute_node(&job.job).await.unwrap();

    let StepOutcome::Succeeded { checksum, output } = first else {
        panic!("expected success, got {first:?}");
    };
    assert_eq!(second, StepOutcome::Reused { checksum: checksum.clone(), output: output.clone() });
    assert_eq!(mock.call_count("a"), 1);

    let a = h.store.get_step(run_id, "a").await.unwrap();
    assert_eq!(a.execution_key.as_deref(), Some(checksum.as_str()));
    // b is queued exactly once.
    assert_eq!(h.queue.pending_len().await, 1);
}

// ============================================================
// Branching
// ============================================================

fn diamond() -> Value {
    json!({
        "nodes": [
            { "id": "gate", "type": "IF", "config": { "expression": "inputs.amount > 100" } },
            text("t"), text("f"), text("d")
        ],
        "edges": [
            { "from": "gate", "to": "t", "condition": "true" },
            { "from": "gate", "to": "f", "condition": { "type": "ELSE" } },
            { "from": "t", "to": "d" },
            { "from": "f", "to": "d" }
        ]
    })
}

#[tokio::test]
async fn if_node_skips_the_untaken_branch_but_not_the_join() {
    let mock = MockNode::new();
    let h = Harness::new(diamond(), &mock).await;
    let run_id = h.start(json!({ "amount": 150 })).await;

    h.drain().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(
        h.step_statuses(run_id).await,
        statuses(&[
            ("d", StepStatus::Success),
            ("f", StepStatus::Skipped),
            ("gate", StepStatus::Success),
            ("t", StepStatus::Success),
        ])
    );
    assert_eq!(mock.call_order(), vec!["t", "d"]);

    let gate = h.store.get_step(run_id, "gate").await.unwrap();
    assert_eq!(gate.output, Some(json!({ "result": true, "selected": "t", "skipped": ["f"] })));

    // The join sees only its non-skipped parent.
    let d = h.store.get_step(run_id, "d").await.unwrap();
    assert_eq!(d.input.unwrap()["node"], "t");
}

#[tokio::test]
async fn if_node_reads_upstream_step_outputs() {
    let def = json!({
        "nodes": [
            text("fetch"),
            { "id": "ok", "type": "IF", "config": { "condition": "steps.fetch.outputs.status == 200" } },
            text("happy"), text("sad")
        ],
        "edges": [
            { "from": "fetch", "to": "ok" },
            { "from": "ok", "to": "happy", "condition": "true" },
            { "from": "ok", "to": "sad", "condition": "false" }
        ]
    });
    let mock = MockNode::new().returning("fetch", json!({ "status": 503 }));
    let h = Harness::new(def, &mock).await;
    let run_id = h.start(json!({})).await;

    h.drain().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_order(), vec!["fetch", "sad"]);
    assert_eq!(
        h.store.get_step(run_id, "happy").await.unwrap().status,
        StepStatus::Skipped
    );
}

// ============================================================
// Pause / resume / cancel / retry
// ============================================================

#[tokio::test]
async fn pause_suppresses_new_work_until_resume() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b", "c"]), &mock).await;
    let run_id = h.start(json!({})).await;

    h.step().await; // a
    let paused = h.engine.pause_execution(run_id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    h.drain().await;
    assert_eq!(mock.call_order(), vec!["a"]);
    assert_eq!(h.store.get_step(run_id, "b").await.unwrap().status, StepStatus::Pending);

    assert!(matches!(
        h.engine.pause_execution(run_id).await,
        Err(EngineError::InvalidState { action: "pause", .. })
    ));

    h.engine.resume_execution(run_id).await.unwrap();
    h.drain().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_order(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn resume_racing_a_dropped_job_does_not_strand_the_step() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b"]), &mock).await;
    let run_id = h.start(json!({})).await;

    let claimed = h.queue.dequeue().await.unwrap().unwrap();
    h.engine.pause_execution(run_id).await.unwrap();
    assert_eq!(h.engine.execute_claimed(&claimed).await.unwrap(), StepOutcome::Ignored);

    // Resume lands before the dropped job is acknowledged, so its key is
    // still live and the rescan cannot enqueue `a`.
    h.engine.resume_execution(run_id).await.unwrap();
    assert!(h.queue.pending_keys().await.is_empty());

    h.queue.complete(claimed.id).await.unwrap();
    assert!(h.engine.requeue_dropped(&claimed.job).await.unwrap());
    assert_eq!(h.queue.pending_keys().await, vec![format!("{run_id}:a:0")]);

    h.drain().await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_order(), vec!["a", "b"]);
    assert!(!h.engine.requeue_dropped(&claimed.job).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn redelivery_takes_over_a_step_lost_by_its_worker() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b"]), &mock).await;
    let run_id = h.start(json!({})).await;

    // A worker claims `a`, marks it RUNNING and dies before acknowledging.
    let lost = h.queue.dequeue().await.unwrap().unwrap();
    h.store
        .update_step(run_id, "a", &[StepStatus::Pending], StepUpdate::to(StepStatus::Running))
        .await
        .unwrap()
        .expect("step claimed");

    // A concurrent first delivery never steals a running step.
    assert_eq!(h.engine.execute_node(&lost.job).await.unwrap(), StepOutcome::Ignored);
    assert!(h.queue.dequeue().await.unwrap().is_none());
    assert_eq!(mock.call_count("a"), 0);

    let lease = h.engine.config().job_lease;
    tokio::time::advance(lease).await;
    assert_eq!(h.queue.reclaim_stale(lease).await.unwrap(), 1);

    let redelivered = h.queue.dequeue().await.unwrap().expect("redelivered job");
    assert_eq!(redelivered.attempts, 2);
    worker::process(&h.engine, h.queue.as_ref(), redelivered).await;
    h.drain().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_order(), vec!["a", "b"]);
    let logs = h.engine.export_logs_ndjson(run_id).await.unwrap();
    assert!(logs.contains("step reclaimed after lost delivery"));
}

#[tokio::test]
async fn cancel_skips_every_unfinished_step() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b", "c"]), &mock).await;
    let run_id = h.start(json!({})).await;

    h.step().await; // a
    let cancelled = h.engine.cancel_execution(run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    h.drain().await;
    assert_eq!(mock.call_order(), vec!["a"]);
    assert_eq!(
        h.step_statuses(run_id).await,
        statuses(&[("a", StepStatus::Success), ("b", StepStatus::Skipped), ("c", StepStatus::Skipped)])
    );

    assert!(matches!(
        h.engine.cancel_execution(run_id).await,
        Err(EngineError::InvalidState { .. })
    ));
    assert!(h.engine.resume_execution(run_id).await.is_err());
}

#[tokio::test]
async fn retry_step_reopens_a_failed_run() {
    let mock = MockNode::new().failing_permanent("b", "bad request body");
    let h = Harness::new(linear(&["a", "b", "c"]), &mock).await;
    let run_id = h.start(json!({})).await;

    h.drain().await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Failed);

    assert!(matches!(
        h.engine.retry_step(run_id, "a").await,
        Err(EngineError::InvalidStepState { .. })
    ));

    // The upstream problem is fixed.
    let _ = mock.clone().returning("b", json!({ "fixed": true }));
    let reset = h.engine.retry_step(run_id, "b").await.unwrap();
    assert_eq!(reset.status, StepStatus::Pending);
    assert_eq!(reset.retry_count, 1);
    assert_eq!(reset.error, None);
    assert_eq!(h.run_status(run_id).await, RunStatus::Running);

    h.drain().await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(mock.call_count("b"), 2);
    assert_eq!(mock.call_count("a"), 1);
}

// ============================================================
// Deferred delay
// ============================================================

#[tokio::test(start_paused = true)]
async fn long_delay_frees_the_worker_and_completes_later() {
    let def = json!({
        "nodes": [
            { "id": "wait", "type": "DELAY", "config": { "ms": 60000 } },
            text("after")
        ],
        "edges": [{ "from": "wait", "to": "after" }]
    });
    let mock = MockNode::new();
    let plugins = PluginSet {
        delay: Arc::new(DelayNode::new(Duration::from_secs(5))),
        ..PluginSet::uniform(Arc::new(mock.clone()))
    };
    let h = Harness::with_plugins(def, plugins).await;
    let run_id = h.start(json!({ "payload": 1 })).await;

    let outcome = h.step().await;
    assert_eq!(outcome, StepOutcome::Deferred { delay: Duration::from_secs(60) });
    assert_eq!(h.store.get_step(run_id, "wait").await.unwrap().status, StepStatus::Running);
    assert!(h.queue.pending_keys().await[0].ends_with(":wait:0:resume"));
    assert_eq!(h.queue.next_due_in().await, Some(Duration::from_secs(60)));

    h.drain().await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    let wait = h.store.get_step(run_id, "wait").await.unwrap();
    assert_eq!(wait.output, Some(json!({ "delayedMs": 60000, "data": { "payload": 1 } })));
    assert_eq!(mock.call_order(), vec!["after"]);
}

// ============================================================
// Versions, read accessors and events
// ============================================================

#[tokio::test]
async fn invalid_definitions_are_rejected_at_publish() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b"]), &mock).await;

    let mut cyclic = linear(&["a", "b", "c"]);
    cyclic["edges"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "from": "c", "to": "a" }));
    let err = h.engine.publish_version(h.workflow_id, "broken", cyclic).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::CycleDetected { .. })));

    let err = h
        .engine
        .publish_version(h.workflow_id, "broken", json!({ "nodes": "nope" }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::Malformed(_))));

    assert!(matches!(
        h.engine.start_execution(Uuid::new_v4(), json!({}), json!({})).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn runs_pin_the_latest_version() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a"]), &mock).await;
    h.engine
        .publish_version(h.workflow_id, "v2", linear(&["a", "b"]))
        .await
        .unwrap();

    let run_id = h.start(json!({})).await;
    h.drain().await;

    let run = h.engine.get_run(run_id).await.unwrap();
    let version = h.store.get_workflow_version(run.workflow_version_id).await.unwrap();
    assert_eq!(version.version, 2);
    assert_eq!(mock.call_order(), vec!["a", "b"]);
}

#[tokio::test]
async fn logs_events_and_ndjson_export() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b"]), &mock).await;
    let mut events = h.engine.subscribe();
    let run_id = h.start(json!({})).await;
    h.drain().await;

    let steps = h.engine.get_step_executions(run_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    let messages: Vec<&str> = steps[0].logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["step started", "step succeeded"]);

    let ndjson = h.engine.export_logs_ndjson(run_id).await.unwrap();
    let lines: Vec<Value> = ndjson
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["node_id"], "a");
    assert_eq!(lines[3]["message"], "step succeeded");

    let mut run_statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id(), run_id);
        if let ExecutionEvent::RunStatusChanged { status, .. } = event {
            run_statuses.push(status);
        }
    }
    assert_eq!(run_statuses, vec![RunStatus::Running, RunStatus::Success]);
}

// ============================================================
// Worker pool
// ============================================================

#[tokio::test(start_paused = true)]
async fn worker_pool_drives_a_run_to_completion() {
    let mock = MockNode::new();
    let h = Harness::new(linear(&["a", "b", "c"]), &mock).await;
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let queue: Arc<dyn JobQueue> = h.queue.clone();
    let handle = tokio::spawn(worker::run(h.engine.clone(), queue, shutdown));

    let run_id = h.start(json!({})).await;
    for _ in 0..100 {
        if h.run_status(run_id).await.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    stop.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert_eq!(h.queue.pending_len().await, 0);
}
