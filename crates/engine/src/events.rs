//! Status-change events for real-time fan-out.
//!
//! The engine only publishes; delivery to clients is up to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use db::models::{LogLevel, RunStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    RunStatusChanged {
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StepStatusChanged {
        run_id: Uuid,
        node_id: String,
        status: StepStatus,
        retry_count: i32,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StepLog {
        run_id: Uuid,
        node_id: String,
        level: LogLevel,
        message: String,
        metadata: Value,
        at: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStatusChanged { run_id, .. }
            | Self::StepStatusChanged { run_id, .. }
            | Self::StepLog { run_id, .. } => *run_id,
        }
    }
}
