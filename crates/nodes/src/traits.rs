//! The `ExecutableNode` trait: the contract every plugin must fulfil.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::NodeError;

/// Shared context passed to every node during execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the workflow the run was started from.
    pub workflow_id: uuid::Uuid,
    /// ID of the current run.
    pub run_id: uuid::Uuid,
    /// ID of the node being executed.
    pub node_id: String,
    /// Input supplied when the run was triggered.
    pub run_input: Value,
    /// Outputs of the run's already-successful steps, keyed by node id.
    pub steps: HashMap<String, Value>,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
}

/// What a node produced.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// The step is finished with this output.
    Complete(Value),
    /// The step finishes with `output` once `delay` has elapsed; the worker
    /// is released in the meantime.
    Deferred { delay: Duration, output: Value },
}

/// The core node trait.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node with its `config` and assembled `input` and return
    /// its JSON output.
    async fn execute(
        &self,
        config: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError>;
}
