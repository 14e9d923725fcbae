//! Step execution repository functions.

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    DbError,
    models::{StepExecutionRow, StepStatus, StepUpdate},
};

const COLUMNS: &str = "id, run_id, node_id, status, execution_key, retry_count, input, output, \
     error, created_at, started_at, completed_at, updated_at";

/// Insert one `PENDING` step row per node of a freshly created run.
pub async fn insert_pending_steps(
    conn: &mut PgConnection,
    run_id: Uuid,
    node_ids: &[String],
) -> Result<(), DbError> {
    let now = Utc::now();
    let ids: Vec<Uuid> = node_ids.iter().map(|_| Uuid::new_v4()).collect();

    sqlx::query(
        r#"
        INSERT INTO step_executions (id, run_id, node_id, status, retry_count, created_at, updated_at)
        SELECT id, $2, node_id, 'PENDING', 0, $3, $3
        FROM UNNEST($1::uuid[], $4::text[]) AS t(id, node_id)
        "#,
    )
    .bind(ids)
    .bind(run_id)
    .bind(now)
    .bind(node_ids)
    .execute(conn)
    .await?;

    Ok(())
}

/// Fetch the step row of one node.
pub async fn get_step(pool: &PgPool, run_id: Uuid, node_id: &str) -> Result<StepExecutionRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM step_executions WHERE run_id = $1 AND node_id = $2");

    sqlx::query_as::<_, StepExecutionRow>(&sql)
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("step execution", format!("{run_id}/{node_id}")))
}

/// All step rows of a run, ordered by node id.
pub async fn list_steps(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepExecutionRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM step_executions WHERE run_id = $1 ORDER BY node_id");

    let rows = sqlx::query_as::<_, StepExecutionRow>(&sql)
        .bind(run_id)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Apply `update` to a step whose current status is one of `from`.
///
/// A single guarded `UPDATE … RETURNING`, so a duplicate delivery racing a
/// legitimate retry can never both win.
pub async fn update_step(
    pool: &PgPool,
    run_id: Uuid,
    node_id: &str,
    from: &[StepStatus],
    update: &StepUpdate,
) -> Result<Option<StepExecutionRow>, DbError> {
    let from: Vec<String> = from.iter().map(|s| s.as_str().to_owned()).collect();
    let sql = format!(
        r#"
        UPDATE step_executions
        SET status = $3,
            execution_key = COALESCE($4, execution_key),
            retry_count = COALESCE($5, retry_count),
            input = COALESCE($6, input),
            output = COALESCE($7, output),
            error = CASE WHEN $8 THEN NULL ELSE COALESCE($9, error) END,
            started_at = CASE WHEN $3 = 'RUNNING' AND started_at IS NULL THEN $10 ELSE started_at END,
            completed_at = CASE
                WHEN $3 IN ('SUCCESS', 'FAILED', 'SKIPPED') THEN $10
                WHEN $3 = 'PENDING' THEN NULL
                ELSE completed_at
            END,
            updated_at = $10
        WHERE run_id = $1 AND node_id = $2 AND status = ANY($11)
        RETURNING {COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, StepExecutionRow>(&sql)
        .bind(run_id)
        .bind(node_id)
        .bind(update.status.as_str())
        .bind(update.execution_key.as_deref())
        .bind(update.retry_count)
        .bind(update.input.as_ref())
        .bind(update.output.as_ref())
        .bind(update.clear_error)
        .bind(update.error_json())
        .bind(Utc::now())
        .bind(from)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Mark the given steps SKIPPED where they have not started yet.
pub async fn skip_steps(pool: &PgPool, run_id: Uuid, node_ids: &[String]) -> Result<u64, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE step_executions
        SET status = 'SKIPPED', completed_at = $3, updated_at = $3
        WHERE run_id = $1 AND node_id = ANY($2) AND status IN ('PENDING', 'RETRYING')
        "#,
    )
    .bind(run_id)
    .bind(node_ids)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Mark every non-terminal step of a run SKIPPED.
pub async fn skip_unfinished_steps(conn: &mut PgConnection, run_id: Uuid) -> Result<u64, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE step_executions
        SET status = 'SKIPPED', completed_at = $2, updated_at = $2
        WHERE run_id = $1 AND status IN ('PENDING', 'RUNNING', 'RETRYING')
        "#,
    )
    .bind(run_id)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
