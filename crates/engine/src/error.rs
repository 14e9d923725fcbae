//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::expr::ExpressionError;

/// A workflow definition was rejected. Never retried; surfaces before any
/// execution starts.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// The definition could not be parsed at all.
    #[error("malformed workflow definition: {0}")]
    Malformed(String),

    #[error("workflow must contain at least one node")]
    Empty,

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    #[error("self-loop on node '{0}'")]
    SelfLoop(String),

    /// DFS found a back-edge; `path` lists the cycle starting and ending at
    /// the same node.
    #[error("workflow graph contains a cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("node '{0}' is disconnected from the rest of the graph")]
    DisconnectedNode(String),

    #[error("IF node '{node_id}' {problem}")]
    InvalidBranching { node_id: String, problem: String },

    #[error("invalid config for node '{node_id}': {reason}")]
    InvalidNodeConfig { node_id: String, reason: String },

    #[error("invalid condition on node '{node_id}': {source}")]
    InvalidCondition {
        node_id: String,
        #[source]
        source: ExpressionError,
    },

    #[error("invalid workflow settings: {0}")]
    InvalidSettings(String),
}

/// Errors produced by the workflow engine.
///
/// Plugin failures never appear here: they are translated into step and
/// run state at the `execute_node` boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The requested operation does not apply to the current state.
    #[error("run {run_id} is {status}; cannot {action}")]
    InvalidState {
        run_id: Uuid,
        status: String,
        action: &'static str,
    },

    #[error("step '{node_id}' of run {run_id} is {status}; cannot {action}")]
    InvalidStepState {
        run_id: Uuid,
        node_id: String,
        status: String,
        action: &'static str,
    },

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<db::DbError> for EngineError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Database(other),
        }
    }
}
