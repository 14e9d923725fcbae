//! The `Store` trait: the durable relational store the engine is written
//! against.
//!
//! Every status change goes through a guarded transition (`from` set →
//! new status) that the implementation applies as a single atomic
//! read-modify-write. A transition whose guard does not match returns
//! `Ok(None)` rather than an error so callers can treat lost races as no-ops.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        ExecutionLogRow, NewLog, NewRun, RunRow, RunStatus, StepExecutionRow, StepStatus,
        StepUpdate, WorkflowVersionRow,
    },
};

#[async_trait]
pub trait Store: Send + Sync {
    // ------ workflow versions ------

    /// Store a new immutable version; its number is one past the latest.
    async fn create_workflow_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        definition: Value,
    ) -> Result<WorkflowVersionRow, DbError>;

    async fn latest_workflow_version(&self, workflow_id: Uuid)
        -> Result<WorkflowVersionRow, DbError>;

    async fn get_workflow_version(&self, id: Uuid) -> Result<WorkflowVersionRow, DbError>;

    // ------ runs ------

    /// Create a PENDING run and one PENDING step row per node, atomically.
    async fn create_run(&self, run: NewRun, node_ids: &[String]) -> Result<RunRow, DbError>;

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError>;

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<Option<RunRow>, DbError>;

    /// Set the run CANCELLED and every non-terminal step SKIPPED in one
    /// transaction. Returns `None` if the run was already terminal.
    async fn cancel_run(&self, id: Uuid) -> Result<Option<RunRow>, DbError>;

    // ------ step executions ------

    async fn get_step(&self, run_id: Uuid, node_id: &str) -> Result<StepExecutionRow, DbError>;

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepExecutionRow>, DbError>;

    async fn update_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        from: &[StepStatus],
        update: StepUpdate,
    ) -> Result<Option<StepExecutionRow>, DbError>;

    /// Bulk-transition the named steps to SKIPPED where they are still
    /// PENDING or RETRYING. Returns the number of rows changed.
    async fn skip_steps(&self, run_id: Uuid, node_ids: &[String]) -> Result<u64, DbError>;

    // ------ execution logs ------

    async fn append_log(&self, entry: NewLog) -> Result<ExecutionLogRow, DbError>;

    /// All log lines of a run in insertion order.
    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExecutionLogRow>, DbError>;
}
