//! Postgres-table job queue.
//!
//! Workers poll the `job_queue` table and use `SELECT … FOR UPDATE SKIP
//! LOCKED` for safe concurrent processing. Delayed jobs carry a future
//! `run_at`; failed jobs stay in the table with `status = 'failed'`.
//! A `processing` row's `updated_at` is its claim time; rows claimed longer
//! than the lease ago go back to `pending`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{JobQueue, QueueError, QueuedJob, StepJob};

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    job_key: String,
    attempts: i32,
    payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, job: StepJob, delay: Duration) -> Result<bool, QueueError> {
        let now = Utc::now();
        let run_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let key = job.key();
        let payload = serde_json::to_value(&job)?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO job_queue (id, job_key, status, attempts, payload, run_at, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, $3, $4, $5, $5)
            ON CONFLICT (job_key) WHERE status IN ('pending', 'processing') DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key)
        .bind(payload)
        .bind(run_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            debug!("job '{}' already queued, skipping duplicate", key);
        }
        Ok(inserted.is_some())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_key, attempts, payload
            FROM job_queue
            WHERE status = 'pending' AND run_at <= $1
            ORDER BY run_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'processing', attempts = attempts + 1, updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let job: StepJob = serde_json::from_value(row.payload)?;
        Ok(Some(QueuedJob {
            id: row.id,
            key: row.job_key,
            attempts: (row.attempts + 1) as u32,
            job,
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'completed', updated_at = $1 WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id));
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'failed', last_error = $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id));
        }
        Ok(())
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::milliseconds(lease.as_millis() as i64);
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', run_at = $1, updated_at = $1
            WHERE status = 'processing' AND updated_at <= $2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, "requeued jobs whose lease expired");
        }
        Ok(reclaimed)
    }
}
