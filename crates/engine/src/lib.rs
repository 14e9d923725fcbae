//! `engine` crate: workflow models, DAG validation and compilation, and the
//! orchestrator that drives runs through the queue.

pub mod branch;
pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod idempotency;
pub mod models;
pub mod plugins;
pub mod retry;
pub mod worker;

pub use config::EngineConfig;
pub use dag::{compile, validate, DagRuntime};
pub use error::{EngineError, ValidationError};
pub use events::ExecutionEvent;
pub use executor::{StepOutcome, StepWithLogs, WorkflowEngine};
pub use models::{Edge, NodeConfig, NodeKind, RetryConfig, WorkflowDefinition};
pub use plugins::PluginSet;

#[cfg(test)]
mod executor_tests;
