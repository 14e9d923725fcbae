//! In-process [`Store`] used by tests and single-process local runs.
//!
//! All tables live behind one async mutex, so every trait method is a single
//! atomic read-modify-write: the same guarantee the Postgres store gets from
//! guarded `UPDATE … RETURNING` statements and transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    DbError, Store,
    models::{
        ExecutionLogRow, NewLog, NewRun, RunRow, RunStatus, StepExecutionRow, StepStatus,
        StepUpdate, WorkflowVersionRow,
    },
};

#[derive(Default)]
struct Tables {
    versions: HashMap<Uuid, WorkflowVersionRow>,
    runs: HashMap<Uuid, RunRow>,
    /// Keyed by (run_id, node_id).
    steps: HashMap<(Uuid, String), StepExecutionRow>,
    logs: Vec<ExecutionLogRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_update(step: &mut StepExecutionRow, update: StepUpdate) {
    let now = Utc::now();
    let error = update.error_json();

    step.status = update.status;
    if let Some(key) = update.execution_key {
        step.execution_key = Some(key);
    }
    if let Some(count) = update.retry_count {
        step.retry_count = count;
    }
    if let Some(input) = update.input {
        step.input = Some(input);
    }
    if let Some(output) = update.output {
        step.output = Some(output);
    }
    if update.clear_error {
        step.error = None;
    } else if error.is_some() {
        step.error = error;
    }

    match update.status {
        StepStatus::Running if step.started_at.is_none() => step.started_at = Some(now),
        StepStatus::Success | StepStatus::Failed | StepStatus::Skipped => {
            step.completed_at = Some(now)
        }
        StepStatus::Pending => step.completed_at = None,
        _ => {}
    }
    step.updated_at = now;
}

fn apply_run_status(run: &mut RunRow, to: RunStatus) {
    let now = Utc::now();
    run.status = to;
    if to == RunStatus::Running && run.started_at.is_none() {
        run.started_at = Some(now);
    }
    run.completed_at = to.is_terminal().then_some(now);
    run.updated_at = now;
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_workflow_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        definition: Value,
    ) -> Result<WorkflowVersionRow, DbError> {
        let mut tables = self.tables.lock().await;
        let version = tables
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;

        let row = WorkflowVersionRow {
            id: Uuid::new_v4(),
            workflow_id,
            version,
            name: name.to_owned(),
            definition,
            created_at: Utc::now(),
        };
        tables.versions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn latest_workflow_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowVersionRow, DbError> {
        let tables = self.tables.lock().await;
        tables
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .max_by_key(|v| v.version)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow", workflow_id))
    }

    async fn get_workflow_version(&self, id: Uuid) -> Result<WorkflowVersionRow, DbError> {
        let tables = self.tables.lock().await;
        tables
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow version", id))
    }

    async fn create_run(&self, run: NewRun, node_ids: &[String]) -> Result<RunRow, DbError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();

        let row = RunRow {
            id: Uuid::new_v4(),
            workflow_id: run.workflow_id,
            workflow_version_id: run.workflow_version_id,
            status: RunStatus::Pending,
            input: run.input,
            metadata: run.metadata,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        for node_id in node_ids {
            let step = StepExecutionRow {
                id: Uuid::new_v4(),
                run_id: row.id,
                node_id: node_id.clone(),
                status: StepStatus::Pending,
                execution_key: None,
                retry_count: 0,
                input: None,
                output: None,
                error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
            };
            tables.steps.insert((row.id, node_id.clone()), step);
        }
        tables.runs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        let tables = self.tables.lock().await;
        tables
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("run", id))
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<Option<RunRow>, DbError> {
        let mut tables = self.tables.lock().await;
        let Some(run) = tables.runs.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&run.status) {
            return Ok(None);
        }
        apply_run_status(run, to);
        Ok(Some(run.clone()))
    }

    async fn cancel_run(&self, id: Uuid) -> Result<Option<RunRow>, DbError> {
        let mut tables = self.tables.lock().await;
        let Some(run) = tables.runs.get_mut(&id) else {
            return Ok(None);
        };
        if run.status.is_terminal() {
            return Ok(None);
        }
        apply_run_status(run, RunStatus::Cancelled);
        let cancelled = run.clone();

        for ((run_id, _), step) in tables.steps.iter_mut() {
            if *run_id == id && !step.status.is_terminal() {
                apply_update(step, StepUpdate::to(StepStatus::Skipped));
            }
        }
        Ok(Some(cancelled))
    }

    async fn get_step(&self, run_id: Uuid, node_id: &str) -> Result<StepExecutionRow, DbError> {
        let tables = self.tables.lock().await;
        tables
            .steps
            .get(&(run_id, node_id.to_owned()))
            .cloned()
            .ok_or_else(|| DbError::not_found("step execution", format!("{run_id}/{node_id}")))
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepExecutionRow>, DbError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<StepExecutionRow> = tables
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(rows)
    }

    async fn update_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        from: &[StepStatus],
        update: StepUpdate,
    ) -> Result<Option<StepExecutionRow>, DbError> {
        let mut tables = self.tables.lock().await;
        let Some(step) = tables.steps.get_mut(&(run_id, node_id.to_owned())) else {
            return Ok(None);
        };
        if !from.contains(&step.status) {
            return Ok(None);
        }
        apply_update(step, update);
        Ok(Some(step.clone()))
    }

    async fn skip_steps(&self, run_id: Uuid, node_ids: &[String]) -> Result<u64, DbError> {
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        for node_id in node_ids {
            if let Some(step) = tables.steps.get_mut(&(run_id, node_id.clone())) {
                if matches!(step.status, StepStatus::Pending | StepStatus::Retrying) {
                    apply_update(step, StepUpdate::to(StepStatus::Skipped));
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn append_log(&self, entry: NewLog) -> Result<ExecutionLogRow, DbError> {
        let mut tables = self.tables.lock().await;
        let row = ExecutionLogRow {
            id: Uuid::new_v4(),
            step_execution_id: entry.step_execution_id,
            run_id: entry.run_id,
            node_id: entry.node_id,
            level: entry.level,
            message: entry.message,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        tables.logs.push(row.clone());
        Ok(row)
    }

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExecutionLogRow>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect())
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepError;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, RunRow) {
        let store = MemoryStore::new();
        let version = store
            .create_workflow_version(Uuid::new_v4(), "wf", json!({ "nodes": [] }))
            .await
            .unwrap();
        let run = store
            .create_run(
                NewRun {
                    workflow_id: version.workflow_id,
                    workflow_version_id: version.id,
                    input: json!({ "x": 1 }),
                    metadata: json!({}),
                },
                &["a".to_string(), "b".to_string()],
            )
            .await
            .unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn versions_are_numbered_per_workflow() {
        let store = MemoryStore::new();
        let wf = Uuid::new_v4();
        store.create_workflow_version(wf, "v", json!({})).await.unwrap();
        let second = store.create_workflow_version(wf, "v", json!({})).await.unwrap();
        store.create_workflow_version(Uuid::new_v4(), "other", json!({})).await.unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(store.latest_workflow_version(wf).await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn run_creation_seeds_one_pending_step_per_node() {
        let (store, run) = seeded().await;
        let steps = store.list_steps(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending && s.retry_count == 0));
    }

    #[tokio::test]
    async fn guarded_step_update_rejects_wrong_source_status() {
        let (store, run) = seeded().await;

        let first = store
            .update_step(run.id, "a", &[StepStatus::Pending], StepUpdate::to(StepStatus::Running))
            .await
            .unwrap();
        let second = store
            .update_step(run.id, "a", &[StepStatus::Pending], StepUpdate::to(StepStatus::Running))
            .await
            .unwrap();

        assert!(first.unwrap().started_at.is_some());
        assert!(second.is_none(), "a duplicate transition must lose the race");
    }

    #[tokio::test]
    async fn reset_to_pending_clears_error_and_completion() {
        let (store, run) = seeded().await;
        store
            .update_step(
                run.id,
                "a",
                &[StepStatus::Pending],
                StepUpdate::to(StepStatus::Failed).error(StepError {
                    message: "boom".into(),
                    stack: None,
                }),
            )
            .await
            .unwrap();

        let reset = store
            .update_step(
                run.id,
                "a",
                &[StepStatus::Failed],
                StepUpdate::to(StepStatus::Pending).retry_count(1).clear_error(),
            )
            .await
            .unwrap()
            .unwrap();

        assert!(reset.error.is_none());
        assert!(reset.completed_at.is_none());
        assert_eq!(reset.retry_count, 1);
    }

    #[tokio::test]
    async fn cancel_skips_only_unfinished_steps() {
        let (store, run) = seeded().await;
        store
            .update_step(run.id, "a", &[StepStatus::Pending], StepUpdate::to(StepStatus::Success))
            .await
            .unwrap();

        let cancelled = store.cancel_run(run.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(store.get_step(run.id, "a").await.unwrap().status, StepStatus::Success);
        assert_eq!(store.get_step(run.id, "b").await.unwrap().status, StepStatus::Skipped);

        assert!(store.cancel_run(run.id).await.unwrap().is_none());
    }
}
