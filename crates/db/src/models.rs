//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour beyond
//! status predicates. Workflow definitions are stored as opaque JSON; their
//! typed form lives in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
///
/// `PENDING → RUNNING → {SUCCESS | FAILED | CANCELLED}`, with
/// `RUNNING ⇄ PAUSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"   => Ok(Self::Pending),
            "RUNNING"   => Ok(Self::Running),
            "PAUSED"    => Ok(Self::Paused),
            "SUCCESS"   => Ok(Self::Success),
            "FAILED"    => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

impl TryFrom<String> for RunStatus {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle of a single step execution.
///
/// `PENDING → RUNNING → {SUCCESS | FAILED | SKIPPED}`, with
/// `RUNNING → RETRYING → RUNNING` cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// A parent in this state no longer blocks its children.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"  => Ok(Self::Pending),
            "RUNNING"  => Ok(Self::Running),
            "RETRYING" => Ok(Self::Retrying),
            "SUCCESS"  => Ok(Self::Success),
            "FAILED"   => Ok(Self::Failed),
            "SKIPPED"  => Ok(Self::Skipped),
            other      => Err(format!("unknown step status: {other}")),
        }
    }
}

impl TryFrom<String> for StepStatus {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Severity of an execution log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;
    fn try_from(value: String) -> Result<Self, String> {
        match value.as_str() {
            "debug" => Ok(Self::Debug),
            "info"  => Ok(Self::Info),
            "warn"  => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other   => Err(format!("unknown log level: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_versions
// ---------------------------------------------------------------------------

/// An immutable, numbered version of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowVersionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub name: String,
    /// Full JSON DAG definition (nodes, edges, settings).
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// Data needed to create a run together with its step rows.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub input: Value,
    /// Trigger metadata (triggering user, source, …).
    pub metadata: Value,
}

/// One execution attempt of a pinned workflow version. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub input: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// step_executions
// ---------------------------------------------------------------------------

/// Persisted failure detail of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Exactly one row per (run, node). Retries update the row in place.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepExecutionRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    #[sqlx(try_from = "String")]
    pub status: StepStatus,
    /// Idempotency checksum of the last attempt's inputs.
    pub execution_key: Option<String>,
    pub retry_count: i32,
    pub input: Option<Value>,
    pub output: Option<Value>,
    /// Serialized [`StepError`].
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecutionRow {
    pub fn step_error(&self) -> Option<StepError> {
        self.error
            .as_ref()
            .and_then(|e| serde_json::from_value(e.clone()).ok())
    }
}

/// A guarded status transition of a step row.
///
/// Fields left as `None` keep their stored value. Timestamps are maintained
/// by the store: `started_at` is set on the first move to RUNNING,
/// `completed_at` on a terminal status and cleared on a reset to PENDING.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub execution_key: Option<String>,
    pub retry_count: Option<i32>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<StepError>,
    pub clear_error: bool,
}

impl StepUpdate {
    pub fn to(status: StepStatus) -> Self {
        Self {
            status,
            execution_key: None,
            retry_count: None,
            input: None,
            output: None,
            error: None,
            clear_error: false,
        }
    }

    pub fn execution_key(mut self, key: impl Into<String>) -> Self {
        self.execution_key = Some(key.into());
        self
    }

    pub fn retry_count(mut self, count: i32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: StepError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    pub(crate) fn error_json(&self) -> Option<Value> {
        self.error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok())
    }
}

// ---------------------------------------------------------------------------
// execution_logs
// ---------------------------------------------------------------------------

/// Data for a new append-only log line.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub step_execution_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Value,
}

/// A persisted execution log line. Write-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionLogRow {
    pub id: Uuid,
    pub step_execution_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    #[sqlx(try_from = "String")]
    pub level: LogLevel,
    pub message: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
