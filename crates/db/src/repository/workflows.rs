//! Workflow version operations.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::WorkflowVersionRow};

const COLUMNS: &str = "id, workflow_id, version, name, definition, created_at";

/// Insert the next version of a workflow.
///
/// The version number is computed inside the insert so concurrent publishers
/// collide on the `(workflow_id, version)` unique key instead of silently
/// sharing a number.
pub async fn create_version(
    pool: &PgPool,
    workflow_id: Uuid,
    name: &str,
    definition: serde_json::Value,
) -> Result<WorkflowVersionRow, DbError> {
    let sql = format!(
        r#"
        INSERT INTO workflow_versions (id, workflow_id, version, name, definition, created_at)
        VALUES (
            $1, $2,
            (SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_versions WHERE workflow_id = $2),
            $3, $4, $5
        )
        RETURNING {COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, WorkflowVersionRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(workflow_id)
        .bind(name)
        .bind(definition)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Fetch the highest-numbered version of a workflow.
pub async fn latest_version(pool: &PgPool, workflow_id: Uuid) -> Result<WorkflowVersionRow, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM workflow_versions WHERE workflow_id = $1 ORDER BY version DESC LIMIT 1"
    );

    sqlx::query_as::<_, WorkflowVersionRow>(&sql)
        .bind(workflow_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("workflow", workflow_id))
}

/// Fetch a single version by its primary key.
pub async fn get_version(pool: &PgPool, id: Uuid) -> Result<WorkflowVersionRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_versions WHERE id = $1");

    sqlx::query_as::<_, WorkflowVersionRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("workflow version", id))
}
