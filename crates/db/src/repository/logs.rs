//! Execution log repository functions. Append-only.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{ExecutionLogRow, NewLog},
};

const COLUMNS: &str = "id, step_execution_id, run_id, node_id, level, message, metadata, created_at";

pub async fn insert_log(pool: &PgPool, entry: &NewLog) -> Result<ExecutionLogRow, DbError> {
    let sql = format!(
        r#"
        INSERT INTO execution_logs (id, step_execution_id, run_id, node_id, level, message, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, ExecutionLogRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(entry.step_execution_id)
        .bind(entry.run_id)
        .bind(&entry.node_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Log lines of a run in insertion order.
pub async fn list_logs(pool: &PgPool, run_id: Uuid) -> Result<Vec<ExecutionLogRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM execution_logs WHERE run_id = $1 ORDER BY seq");

    let rows = sqlx::query_as::<_, ExecutionLogRow>(&sql)
        .bind(run_id)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
