//! Run repository functions.

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    DbError,
    models::{NewRun, RunRow, RunStatus},
};

pub(crate) const COLUMNS: &str = "id, workflow_id, workflow_version_id, status, input, metadata, \
     created_at, started_at, completed_at, updated_at";

/// Insert a new run in `PENDING` status.
pub async fn insert_run(conn: &mut PgConnection, run: &NewRun) -> Result<RunRow, DbError> {
    let now = Utc::now();
    let sql = format!(
        r#"
        INSERT INTO runs (id, workflow_id, workflow_version_id, status, input, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $6)
        RETURNING {COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(run.workflow_id)
        .bind(run.workflow_version_id)
        .bind(&run.input)
        .bind(&run.metadata)
        .bind(now)
        .fetch_one(conn)
        .await?;

    Ok(row)
}

/// Fetch a run by id.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE id = $1");

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("run", id))
}

/// Move a run to `to` if its current status is one of `from`.
///
/// `started_at` is stamped on the first move to RUNNING. `completed_at` is
/// stamped on a terminal status and cleared when a run is reopened.
pub async fn transition_run(
    conn: &mut PgConnection,
    id: Uuid,
    from: &[RunStatus],
    to: RunStatus,
) -> Result<Option<RunRow>, DbError> {
    let from: Vec<String> = from.iter().map(|s| s.as_str().to_owned()).collect();
    let sql = format!(
        r#"
        UPDATE runs
        SET status = $2,
            started_at = CASE WHEN $2 = 'RUNNING' AND started_at IS NULL THEN $3 ELSE started_at END,
            completed_at = CASE WHEN $4 THEN $3 ELSE NULL END,
            updated_at = $3
        WHERE id = $1 AND status = ANY($5)
        RETURNING {COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(id)
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(to.is_terminal())
        .bind(from)
        .fetch_optional(conn)
        .await?;

    Ok(row)
}
