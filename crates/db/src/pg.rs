//! Postgres-backed [`Store`] built on the repository functions.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    DbError, DbPool, Store,
    models::{
        ExecutionLogRow, NewLog, NewRun, RunRow, RunStatus, StepExecutionRow, StepStatus,
        StepUpdate, WorkflowVersionRow,
    },
    repository::{logs, runs, steps, workflows},
};

/// Shares one connection pool across all engine components.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_workflow_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        definition: Value,
    ) -> Result<WorkflowVersionRow, DbError> {
        workflows::create_version(&self.pool, workflow_id, name, definition).await
    }

    async fn latest_workflow_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowVersionRow, DbError> {
        workflows::latest_version(&self.pool, workflow_id).await
    }

    async fn get_workflow_version(&self, id: Uuid) -> Result<WorkflowVersionRow, DbError> {
        workflows::get_version(&self.pool, id).await
    }

    async fn create_run(&self, run: NewRun, node_ids: &[String]) -> Result<RunRow, DbError> {
        let mut tx = self.pool.begin().await?;
        let row = runs::insert_run(&mut tx, &run).await?;
        steps::insert_pending_steps(&mut tx, row.id, node_ids).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        runs::get_run(&self.pool, id).await
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<Option<RunRow>, DbError> {
        let mut conn = self.pool.acquire().await?;
        runs::transition_run(&mut conn, id, from, to).await
    }

    async fn cancel_run(&self, id: Uuid) -> Result<Option<RunRow>, DbError> {
        let mut tx = self.pool.begin().await?;
        let cancelled = runs::transition_run(
            &mut tx,
            id,
            &[RunStatus::Pending, RunStatus::Running, RunStatus::Paused],
            RunStatus::Cancelled,
        )
        .await?;

        match cancelled {
            Some(row) => {
                steps::skip_unfinished_steps(&mut tx, id).await?;
                tx.commit().await?;
                Ok(Some(row))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn get_step(&self, run_id: Uuid, node_id: &str) -> Result<StepExecutionRow, DbError> {
        steps::get_step(&self.pool, run_id, node_id).await
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepExecutionRow>, DbError> {
        steps::list_steps(&self.pool, run_id).await
    }

    async fn update_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        from: &[StepStatus],
        update: StepUpdate,
    ) -> Result<Option<StepExecutionRow>, DbError> {
        steps::update_step(&self.pool, run_id, node_id, from, &update).await
    }

    async fn skip_steps(&self, run_id: Uuid, node_ids: &[String]) -> Result<u64, DbError> {
        steps::skip_steps(&self.pool, run_id, node_ids).await
    }

    async fn append_log(&self, entry: NewLog) -> Result<ExecutionLogRow, DbError> {
        logs::insert_log(&self.pool, &entry).await
    }

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExecutionLogRow>, DbError> {
        logs::list_logs(&self.pool, run_id).await
    }
}
