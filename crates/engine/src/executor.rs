//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator. It owns no threads: callers
//! start runs, and queue workers feed step jobs back through
//! [`WorkflowEngine::execute_node`]. Every status change is a guarded
//! transition in the [`Store`], so duplicate deliveries and pause/cancel
//! races resolve to no-ops instead of lost updates.
//!
//! 1. `start_execution` compiles the pinned version, creates the run with one
//!    PENDING step per node and enqueues the roots.
//! 2. `execute_node` runs one step: idempotent reuse, plugin or IF
//!    evaluation, then success or failure handling. `execute_claimed` does
//!    the same for a queue delivery and lets a redelivery take over a step
//!    whose worker was lost.
//! 3. `handle_node_success` enqueues children whose parents are all
//!    SUCCESS or SKIPPED, then checks whether the run is complete.
//! 4. `handle_node_failure` retries with backoff on the same step row, or
//!    fails the step and the run.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::{
    Store,
    models::{
        ExecutionLogRow, LogLevel, NewLog, NewRun, RunRow, RunStatus, StepError, StepExecutionRow,
        StepStatus, StepUpdate, WorkflowVersionRow,
    },
};
use nodes::{ExecutionContext, NodeError, NodeOutput};
use queue::{JobQueue, QueuedJob, StepJob};

use crate::{
    EngineError,
    branch,
    config::EngineConfig,
    dag::{self, DagRuntime},
    events::ExecutionEvent,
    idempotency,
    models::{NodeConfig, NodeKind},
    plugins::PluginSet,
    retry,
};

// ---------------------------------------------------------------------------
// Outcomes and read models
// ---------------------------------------------------------------------------

/// What one `execute_node` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing to do: the run is not RUNNING, or the step was already taken
    /// by another delivery.
    Ignored,
    /// A prior successful result with the same checksum was reused.
    Reused { checksum: String, output: Value },
    Succeeded { checksum: String, output: Value },
    /// The step stays RUNNING until its continuation job fires.
    Deferred { delay: Duration },
    Retrying { retry_count: u32, delay_ms: u64 },
    Failed { error: String },
}

/// A step execution together with its log lines.
#[derive(Debug, Clone, Serialize)]
pub struct StepWithLogs {
    #[serde(flatten)]
    pub step: StepExecutionRow,
    pub logs: Vec<ExecutionLogRow>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    plugins: PluginSet,
    config: EngineConfig,
    /// Compiled DAGs keyed by run id; dropped when the run ends.
    dags: DashMap<Uuid, Arc<DagRuntime>>,
    /// Per-run `maxConcurrency` limits.
    slots: DashMap<Uuid, Arc<Semaphore>>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>, plugins: PluginSet, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            store,
            queue,
            plugins,
            config,
            dags: DashMap::new(),
            slots: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive run/step status changes and log lines as they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Workflow versions
    // ------------------------------------------------------------------

    /// Validate `definition` and store it as the next version of `workflow_id`.
    #[instrument(skip(self, definition), fields(workflow_id = %workflow_id))]
    pub async fn publish_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        definition: Value,
    ) -> Result<WorkflowVersionRow, EngineError> {
        let parsed = dag::parse_definition(&definition)?;
        dag::validate(&parsed)?;
        let version = self.store.create_workflow_version(workflow_id, name, definition).await?;
        info!(version = version.version, "published workflow version");
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    /// Start a run of the latest version of `workflow_id` and enqueue its roots.
    #[instrument(skip(self, input, metadata), fields(workflow_id = %workflow_id))]
    pub async fn start_execution(
        &self,
        workflow_id: Uuid,
        input: Value,
        metadata: Value,
    ) -> Result<Uuid, EngineError> {
        let version = self.store.latest_workflow_version(workflow_id).await?;
        let dag = Arc::new(self.compile(&version)?);

        let run = self
            .store
            .create_run(
                NewRun {
                    workflow_id,
                    workflow_version_id: version.id,
                    input: input.clone(),
                    metadata,
                },
                dag.topological_order(),
            )
            .await?;
        self.dags.insert(run.id, dag.clone());

        let run = self
            .store
            .transition_run(run.id, &[RunStatus::Pending], RunStatus::Running)
            .await?
            .ok_or_else(|| EngineError::InvalidState {
                run_id: run.id,
                status: RunStatus::Pending.to_string(),
                action: "start",
            })?;
        self.emit_run(&run);

        for root in dag.roots() {
            self.queue
                .enqueue(StepJob::new(run.id, root, input.clone(), 0), Duration::ZERO)
                .await?;
        }

        info!(
            run_id = %run.id,
            version = version.version,
            "run started with {} nodes, roots {:?}",
            dag.len(),
            dag.roots()
        );
        Ok(run.id)
    }

    /// Stop enqueuing new steps. Steps already executing run to completion.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn pause_execution(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let run = self
            .store
            .transition_run(run_id, &[RunStatus::Running], RunStatus::Paused)
            .await?;
        let run = self.require_transition(run_id, run, "pause").await?;
        info!("run paused");
        self.emit_run(&run);
        Ok(run)
    }

    /// Resume a paused run and re-enqueue every waiting step whose parents
    /// are complete.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn resume_execution(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let run = self
            .store
            .transition_run(run_id, &[RunStatus::Paused], RunStatus::Running)
            .await?;
        let run = self.require_transition(run_id, run, "resume").await?;
        info!("run resumed");
        self.emit_run(&run);

        let enqueued = self.rescan(&run).await?;
        debug!(enqueued, "re-enqueued waiting steps");
        self.check_completion(run_id).await?;
        self.store.get_run(run_id).await.map_err(Into::into)
    }

    /// Cancel a run: the run becomes CANCELLED and every unfinished step
    /// SKIPPED in one transaction.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_execution(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let run = self.store.cancel_run(run_id).await?;
        let run = self.require_transition(run_id, run, "cancel").await?;
        info!("run cancelled");
        self.emit_run(&run);
        self.forget(run_id);
        Ok(run)
    }

    /// Reset one FAILED step to PENDING with an incremented retry count and
    /// pick the run back up.
    #[instrument(skip(self), fields(run_id = %run_id, node_id = %node_id))]
    pub async fn retry_step(&self, run_id: Uuid, node_id: &str) -> Result<StepExecutionRow, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if matches!(run.status, RunStatus::Success | RunStatus::Cancelled) {
            return Err(EngineError::InvalidState {
                run_id,
                status: run.status.to_string(),
                action: "retry a step",
            });
        }

        let step = self.store.get_step(run_id, node_id).await?;
        let invalid_step = |status: StepStatus| EngineError::InvalidStepState {
            run_id,
            node_id: node_id.to_owned(),
            status: status.to_string(),
            action: "retry",
        };
        if step.status != StepStatus::Failed {
            return Err(invalid_step(step.status));
        }

        let step = self
            .store
            .update_step(
                run_id,
                node_id,
                &[StepStatus::Failed],
                StepUpdate::to(StepStatus::Pending)
                    .retry_count(step.retry_count + 1)
                    .clear_error(),
            )
            .await?
            .ok_or_else(|| invalid_step(StepStatus::Failed))?;
        self.emit_step(&step);
        self.log(&step, LogLevel::Info, "step reset for manual retry", json!({ "retryCount": step.retry_count }))
            .await?;

        if let Some(reopened) = self
            .store
            .transition_run(run_id, &[RunStatus::Failed, RunStatus::Paused], RunStatus::Running)
            .await?
        {
            info!(from = %run.status, "run reopened for step retry");
            self.emit_run(&reopened);
        }

        let run = self.store.get_run(run_id).await?;
        if run.status == RunStatus::Running {
            self.rescan(&run).await?;
        }
        Ok(step)
    }

    // ------------------------------------------------------------------
    // Step execution
    // ------------------------------------------------------------------

    /// Execute one step job on its first delivery. Plugin failures become
    /// step/run state; only infrastructure errors are returned.
    pub async fn execute_node(&self, job: &StepJob) -> Result<StepOutcome, EngineError> {
        self.execute_job(job, false).await
    }

    /// Execute a job claimed from the queue. A redelivered job (its earlier
    /// claim expired without an acknowledgement) may take over a step left
    /// RUNNING by the worker that lost it.
    pub async fn execute_claimed(&self, claimed: &QueuedJob) -> Result<StepOutcome, EngineError> {
        self.execute_job(&claimed.job, claimed.attempts > 1).await
    }

    #[instrument(
        skip(self, job),
        fields(run_id = %job.run_id, node_id = %job.node_id, retry = job.retry_count)
    )]
    async fn execute_job(&self, job: &StepJob, redelivered: bool) -> Result<StepOutcome, EngineError> {
        let run = self.store.get_run(job.run_id).await?;

        if let Some(output) = &job.continuation {
            return self.complete_deferred(&run, job, output.clone()).await;
        }

        if run.status != RunStatus::Running {
            debug!(status = %run.status, "run not running; dropping job");
            return Ok(StepOutcome::Ignored);
        }

        let dag = self.dag_for(&run).await?;
        let node = dag.node(&job.node_id).ok_or_else(|| EngineError::NotFound {
            entity: "node",
            id: job.node_id.clone(),
        })?;

        // Idempotency short-circuit.
        let checksum = idempotency::checksum(run.id, &node.id, &job.input, &node.plugin_version());
        let prior = idempotency::check_idempotency(self.store.as_ref(), run.id, &node.id, &checksum).await?;
        if prior.reuse {
            let output = prior.output.unwrap_or(Value::Null);
            debug!("reusing prior result");
            self.handle_node_success(run.id, &dag, &node.id, &output).await?;
            return Ok(StepOutcome::Reused { checksum, output });
        }

        let step = self.store.get_step(run.id, &node.id).await?;
        if step.retry_count != job.retry_count as i32 {
            debug!(stored = step.retry_count, "stale retry attempt; dropping job");
            return Ok(StepOutcome::Ignored);
        }

        let _permit = match self.slot(run.id, dag.max_concurrency()) {
            Some(slot) => slot.acquire_owned().await.ok(),
            None => None,
        };

        let takeover = redelivered && step.status == StepStatus::Running;
        let claimable: &[StepStatus] = if takeover {
            &[StepStatus::Running]
        } else {
            &[StepStatus::Pending, StepStatus::Retrying]
        };
        let Some(step) = self
            .store
            .update_step(
                run.id,
                &node.id,
                claimable,
                StepUpdate::to(StepStatus::Running)
                    .execution_key(checksum.clone())
                    .input(job.input.clone()),
            )
            .await?
        else {
            debug!("step already claimed; dropping job");
            return Ok(StepOutcome::Ignored);
        };
        if takeover {
            warn!("taking over step left running by a lost worker");
            self.log(&step, LogLevel::Warn, "step reclaimed after lost delivery", json!({ "attempt": job.retry_count + 1 }))
                .await?;
        }
        self.emit_step(&step);

        let attempt = job.retry_count + 1;
        self.log(&step, LogLevel::Info, "step started", json!({ "attempt": attempt, "type": node.kind }))
            .await?;

        let ctx = ExecutionContext {
            workflow_id: run.workflow_id,
            run_id: run.id,
            node_id: node.id.clone(),
            run_input: run.input.clone(),
            steps: self.completed_outputs(run.id).await?,
            attempt,
        };

        let result = match self.plugins.handler(node.kind) {
            Some(plugin) => plugin.execute(&node.config, job.input.clone(), &ctx).await,
            None => self.evaluate_branch(&dag, node, &ctx).map(NodeOutput::Complete),
        };

        // The run may have been cancelled while the plugin ran.
        let current = self.store.get_run(run.id).await?;
        if current.status == RunStatus::Cancelled {
            info!("run cancelled during execution; discarding result");
            return Ok(StepOutcome::Ignored);
        }

        match result {
            Ok(NodeOutput::Complete(output)) => self.finish_success(run.id, &dag, node, checksum, output).await,
            Ok(NodeOutput::Deferred { delay, output }) => {
                self.queue.enqueue(job.continuation_of(output), delay).await?;
                self.log(&step, LogLevel::Info, "step deferred", json!({ "delayMs": delay.as_millis() as u64 }))
                    .await?;
                Ok(StepOutcome::Deferred { delay })
            }
            Err(err) => self.handle_node_failure(&step, &dag, node, job, err).await,
        }
    }

    /// Evaluate an IF node. The output records the decision so that skip
    /// propagation can be replayed from the stored result.
    fn evaluate_branch(&self, dag: &DagRuntime, node: &NodeConfig, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let condition = dag
            .condition(&node.id)
            .ok_or_else(|| NodeError::invalid_config("IF", "missing condition"))?;
        let result = branch::evaluate(condition, &ctx.steps, &ctx.run_input)
            .map_err(|e| NodeError::Permanent(format!("condition evaluation failed: {e}")))?;
        let decision = branch::determine_branch(dag, &node.id, result)
            .ok_or_else(|| NodeError::invalid_config("IF", "branch edges missing"))?;
        let skipped = branch::compute_skipped_nodes(dag, &decision.skipped, &decision.selected);

        Ok(json!({
            "result": result,
            "selected": decision.selected,
            "skipped": skipped,
        }))
    }

    async fn complete_deferred(&self, run: &RunRow, job: &StepJob, output: Value) -> Result<StepOutcome, EngineError> {
        if run.status.is_terminal() {
            debug!(status = %run.status, "run finished; dropping continuation");
            return Ok(StepOutcome::Ignored);
        }
        let dag = self.dag_for(run).await?;
        let node = dag.node(&job.node_id).ok_or_else(|| EngineError::NotFound {
            entity: "node",
            id: job.node_id.clone(),
        })?;
        let step = self.store.get_step(run.id, &node.id).await?;
        let checksum = step
            .execution_key
            .unwrap_or_else(|| idempotency::checksum(run.id, &node.id, &job.input, &node.plugin_version()));
        self.finish_success(run.id, &dag, node, checksum, output).await
    }

    async fn finish_success(
        &self,
        run_id: Uuid,
        dag: &DagRuntime,
        node: &NodeConfig,
        checksum: String,
        output: Value,
    ) -> Result<StepOutcome, EngineError> {
        let Some(step) = self
            .store
            .update_step(
                run_id,
                &node.id,
                &[StepStatus::Running],
                StepUpdate::to(StepStatus::Success)
                    .execution_key(checksum.clone())
                    .output(output.clone())
                    .clear_error(),
            )
            .await?
        else {
            debug!("step no longer running; result discarded");
            return Ok(StepOutcome::Ignored);
        };
        self.emit_step(&step);
        self.log(&step, LogLevel::Info, "step succeeded", json!({ "retryCount": step.retry_count }))
            .await?;

        self.handle_node_success(run_id, dag, &node.id, &output).await?;
        Ok(StepOutcome::Succeeded { checksum, output })
    }

    /// Apply IF skips, enqueue children that became ready, and check whether
    /// the run is complete.
    pub async fn handle_node_success(
        &self,
        run_id: Uuid,
        dag: &DagRuntime,
        node_id: &str,
        output: &Value,
    ) -> Result<(), EngineError> {
        let mut candidates: BTreeSet<String> = dag.children(node_id).iter().cloned().collect();

        if dag.node(node_id).is_some_and(|n| n.kind == NodeKind::If) {
            let skipped: Vec<String> = output
                .get("skipped")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();
            if !skipped.is_empty() {
                let changed = self.store.skip_steps(run_id, &skipped).await?;
                info!(node_id, changed, "skipped untaken branch {:?}", skipped);
                for id in &skipped {
                    candidates.extend(dag.children(id).iter().cloned());
                    let step = self.store.get_step(run_id, id).await?;
                    if step.status == StepStatus::Skipped {
                        self.emit_step(&step);
                    }
                }
            }
        }

        let run = self.store.get_run(run_id).await?;
        if run.status == RunStatus::Running {
            self.enqueue_ready(&run, dag, &candidates, &[StepStatus::Pending]).await?;
        } else {
            debug!(status = %run.status, "run not running; children not enqueued");
        }
        self.check_completion(run_id).await
    }

    /// Retry the step with backoff, or fail it together with the run.
    pub async fn handle_node_failure(
        &self,
        step: &StepExecutionRow,
        dag: &DagRuntime,
        node: &NodeConfig,
        job: &StepJob,
        err: NodeError,
    ) -> Result<StepOutcome, EngineError> {
        let retry = dag.retry_config(&node.id);
        let attempt = job.retry_count + 1;
        let message = err.message();
        warn!(attempt, max_attempts = retry.max_attempts, "step attempt failed: {message}");
        self.log(
            step,
            LogLevel::Warn,
            format!("attempt {attempt} failed: {message}"),
            json!({ "attempt": attempt, "status": err.status_code() }),
        )
        .await?;

        if retry::should_retry(&err, attempt, retry.max_attempts) {
            let delay_ms = retry::calculate_backoff(attempt, &retry);
            let next = job.retry_count + 1;
            let Some(step) = self
                .store
                .update_step(
                    step.run_id,
                    &node.id,
                    &[StepStatus::Running],
                    StepUpdate::to(StepStatus::Retrying)
                        .retry_count(next as i32)
                        .error(StepError { message: message.clone(), stack: None }),
                )
                .await?
            else {
                return Ok(StepOutcome::Ignored);
            };
            self.emit_step(&step);
            self.log(&step, LogLevel::Info, "retry scheduled", json!({ "retryCount": next, "delayMs": delay_ms }))
                .await?;

            // While paused, resume picks RETRYING steps up instead.
            let run = self.store.get_run(step.run_id).await?;
            if run.status == RunStatus::Running {
                self.queue
                    .enqueue(
                        StepJob::new(step.run_id, node.id.clone(), job.input.clone(), next),
                        Duration::from_millis(delay_ms),
                    )
                    .await?;
            }
            return Ok(StepOutcome::Retrying { retry_count: next, delay_ms });
        }

        let Some(step) = self
            .store
            .update_step(
                step.run_id,
                &node.id,
                &[StepStatus::Running],
                StepUpdate::to(StepStatus::Failed).error(StepError {
                    message: message.clone(),
                    stack: Some(format!("{err:?}")),
                }),
            )
            .await?
        else {
            return Ok(StepOutcome::Ignored);
        };
        self.emit_step(&step);
        self.log(&step, LogLevel::Error, format!("step failed: {message}"), json!({ "attempts": attempt }))
            .await?;

        if let Some(run) = self
            .store
            .transition_run(step.run_id, &[RunStatus::Running, RunStatus::Paused], RunStatus::Failed)
            .await?
        {
            error!(node_id = %node.id, "run failed: {message}");
            self.emit_run(&run);
            self.forget(run.id);
        }
        Ok(StepOutcome::Failed { error: message })
    }

    /// Enqueue `candidates` that are in one of `waiting` and whose parents
    /// are all SUCCESS or SKIPPED. Returns how many were enqueued.
    async fn enqueue_ready(
        &self,
        run: &RunRow,
        dag: &DagRuntime,
        candidates: &BTreeSet<String>,
        waiting: &[StepStatus],
    ) -> Result<usize, EngineError> {
        if candidates.is_empty() {
            return Ok(0);
        }
        // Fresh read: siblings may have completed concurrently.
        let steps: HashMap<String, StepExecutionRow> = self
            .store
            .list_steps(run.id)
            .await?
            .into_iter()
            .map(|s| (s.node_id.clone(), s))
            .collect();

        let mut enqueued = 0;
        for node_id in candidates {
            let Some(step) = steps.get(node_id) else { continue };
            if !waiting.contains(&step.status) {
                continue;
            }
            let ready = dag
                .parents(node_id)
                .iter()
                .all(|p| steps.get(p).is_some_and(|s| s.status.satisfies_dependents()));
            if !ready {
                continue;
            }

            let input = assemble_input(&run.input, dag, node_id, &steps);
            let retry_count = u32::try_from(step.retry_count).unwrap_or(0);
            if self
                .queue
                .enqueue(StepJob::new(run.id, node_id.clone(), input, retry_count), Duration::ZERO)
                .await?
            {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Enqueue the step of a dropped job again if it is still waiting and
    /// ready. Called after the job is acknowledged: a resume that raced the
    /// drop found the job's key still live and could not enqueue it.
    pub async fn requeue_dropped(&self, job: &StepJob) -> Result<bool, EngineError> {
        if job.continuation.is_some() {
            return Ok(false);
        }
        let run = self.store.get_run(job.run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        let dag = self.dag_for(&run).await?;
        let candidates = BTreeSet::from([job.node_id.clone()]);
        let enqueued = self
            .enqueue_ready(&run, &dag, &candidates, &[StepStatus::Pending, StepStatus::Retrying])
            .await?;
        if enqueued > 0 {
            debug!(run_id = %run.id, node_id = %job.node_id, "requeued dropped step");
        }
        Ok(enqueued > 0)
    }

    async fn rescan(&self, run: &RunRow) -> Result<usize, EngineError> {
        let dag = self.dag_for(run).await?;
        let waiting: BTreeSet<String> = self
            .store
            .list_steps(run.id)
            .await?
            .into_iter()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Retrying))
            .map(|s| s.node_id)
            .collect();
        self.enqueue_ready(run, &dag, &waiting, &[StepStatus::Pending, StepStatus::Retrying])
            .await
    }

    /// Finish the run once every step is terminal.
    async fn check_completion(&self, run_id: Uuid) -> Result<(), EngineError> {
        let steps = self.store.list_steps(run_id).await?;
        if !steps.iter().all(|s| s.status.is_terminal()) {
            return Ok(());
        }

        let transition = if steps.iter().any(|s| s.status == StepStatus::Failed) {
            self.store
                .transition_run(run_id, &[RunStatus::Running, RunStatus::Paused], RunStatus::Failed)
                .await?
        } else {
            self.store
                .transition_run(run_id, &[RunStatus::Running], RunStatus::Success)
                .await?
        };

        if let Some(run) = transition {
            info!(run_id = %run_id, status = %run.status, "run finished");
            self.emit_run(&run);
            self.forget(run_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Every step of the run with its log lines, sorted by node id.
    pub async fn get_step_executions(&self, run_id: Uuid) -> Result<Vec<StepWithLogs>, EngineError> {
        self.store.get_run(run_id).await?;
        let steps = self.store.list_steps(run_id).await?;
        let mut logs: HashMap<String, Vec<ExecutionLogRow>> = HashMap::new();
        for line in self.store.list_logs(run_id).await? {
            logs.entry(line.node_id.clone()).or_default().push(line);
        }
        Ok(steps
            .into_iter()
            .map(|step| StepWithLogs {
                logs: logs.remove(&step.node_id).unwrap_or_default(),
                step,
            })
            .collect())
    }

    /// The run's log lines as newline-delimited JSON, oldest first.
    pub async fn export_logs_ndjson(&self, run_id: Uuid) -> Result<String, EngineError> {
        self.store.get_run(run_id).await?;
        let mut out = String::new();
        for line in self.store.list_logs(run_id).await? {
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn compile(&self, version: &WorkflowVersionRow) -> Result<DagRuntime, EngineError> {
        let definition = dag::parse_definition(&version.definition)?;
        Ok(dag::compile_with(&definition, self.config.default_retry)?)
    }

    async fn dag_for(&self, run: &RunRow) -> Result<Arc<DagRuntime>, EngineError> {
        if let Some(dag) = self.dags.get(&run.id) {
            return Ok(dag.clone());
        }
        let version = self.store.get_workflow_version(run.workflow_version_id).await?;
        let dag = Arc::new(self.compile(&version)?);
        if !run.status.is_terminal() {
            self.dags.insert(run.id, dag.clone());
        }
        Ok(dag)
    }

    fn slot(&self, run_id: Uuid, max_concurrency: Option<u32>) -> Option<Arc<Semaphore>> {
        let limit = usize::try_from(max_concurrency?).ok()?;
        Some(
            self.slots
                .entry(run_id)
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone(),
        )
    }

    fn forget(&self, run_id: Uuid) {
        self.dags.remove(&run_id);
        self.slots.remove(&run_id);
    }

    async fn completed_outputs(&self, run_id: Uuid) -> Result<HashMap<String, Value>, EngineError> {
        Ok(self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Success)
            .map(|s| (s.node_id, s.output.unwrap_or(Value::Null)))
            .collect())
    }

    async fn require_transition(
        &self,
        run_id: Uuid,
        transitioned: Option<RunRow>,
        action: &'static str,
    ) -> Result<RunRow, EngineError> {
        match transitioned {
            Some(run) => Ok(run),
            None => {
                let current = self.store.get_run(run_id).await?;
                Err(EngineError::InvalidState {
                    run_id,
                    status: current.status.to_string(),
                    action,
                })
            }
        }
    }

    async fn log(
        &self,
        step: &StepExecutionRow,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Value,
    ) -> Result<(), EngineError> {
        let line = self
            .store
            .append_log(NewLog {
                step_execution_id: step.id,
                run_id: step.run_id,
                node_id: step.node_id.clone(),
                level,
                message: message.into(),
                metadata,
            })
            .await?;
        let _ = self.events.send(ExecutionEvent::StepLog {
            run_id: line.run_id,
            node_id: line.node_id,
            level: line.level,
            message: line.message,
            metadata: line.metadata,
            at: line.created_at,
        });
        Ok(())
    }

    fn emit_run(&self, run: &RunRow) {
        let _ = self.events.send(ExecutionEvent::RunStatusChanged {
            run_id: run.id,
            status: run.status,
            at: run.updated_at,
        });
    }

    fn emit_step(&self, step: &StepExecutionRow) {
        let _ = self.events.send(ExecutionEvent::StepStatusChanged {
            run_id: step.run_id,
            node_id: step.node_id.clone(),
            status: step.status,
            retry_count: step.retry_count,
            at: Utc::now(),
        });
    }
}

/// Input for `node_id`: the run input for roots, the output of a single
/// succeeded parent, or an object keyed by parent id otherwise.
fn assemble_input(
    run_input: &Value,
    dag: &DagRuntime,
    node_id: &str,
    steps: &HashMap<String, StepExecutionRow>,
) -> Value {
    let parents = dag.parents(node_id);
    if parents.is_empty() {
        return run_input.clone();
    }
    let mut outputs: Vec<(&String, Value)> = parents
        .iter()
        .filter_map(|p| {
            let step = steps.get(p)?;
            (step.status == StepStatus::Success).then(|| (p, step.output.clone().unwrap_or(Value::Null)))
        })
        .collect();

    if outputs.len() == 1 {
        return outputs.pop().map(|(_, v)| v).unwrap_or(Value::Null);
    }
    Value::Object(outputs.into_iter().map(|(p, v)| (p.clone(), v)).collect())
}
