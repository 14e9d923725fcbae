//! `MockNode`: a test double for `ExecutableNode`.
//!
//! Useful in unit and integration tests where a real plugin is either
//! unavailable or irrelevant. Behaviour can be scripted per node id; nodes
//! without a script echo their id merged with their input.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutput};

/// Behaviour injected into `MockNode` for one node id.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value (merged with `{"node": id}`).
    ReturnValue(Value),
    /// Always fail with this error.
    Fail(NodeError),
    /// Fail with each error in turn, then return the value.
    FailThenReturn(VecDeque<NodeError>, Value),
    /// Defer completion by this long.
    Defer(Duration, Value),
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
#[derive(Clone, Default)]
pub struct MockNode {
    behaviours: Arc<Mutex<HashMap<String, MockBehaviour>>>,
    /// All (node id, input) pairs seen by this mock, in call order.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockNode {
    /// A mock that echoes for every node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour for one node id.
    pub fn on(self, node_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.behaviours
            .lock()
            .unwrap()
            .insert(node_id.into(), behaviour);
        self
    }

    pub fn returning(self, node_id: impl Into<String>, value: Value) -> Self {
        self.on(node_id, MockBehaviour::ReturnValue(value))
    }

    pub fn failing_permanent(self, node_id: impl Into<String>, msg: impl Into<String>) -> Self {
        self.on(node_id, MockBehaviour::Fail(NodeError::Permanent(msg.into())))
    }

    pub fn failing_transient(self, node_id: impl Into<String>, msg: impl Into<String>) -> Self {
        self.on(node_id, MockBehaviour::Fail(NodeError::Transient(msg.into())))
    }

    /// Fail `times` times with `error`, then succeed with `value`.
    pub fn flaky(self, node_id: impl Into<String>, times: usize, error: NodeError, value: Value) -> Self {
        let errors = std::iter::repeat(error).take(times).collect();
        self.on(node_id, MockBehaviour::FailThenReturn(errors, value))
    }

    /// Number of times `node_id` has been executed.
    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .count()
    }

    /// Node ids in the order they were executed.
    pub fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn tagged(node_id: &str, value: &Value) -> Value {
        // Merge the node's own output with its id so tests can trace the
        // data flowing through the graph.
        let mut out = json!({ "node": node_id });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(
        &self,
        _config: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.node_id.clone(), input.clone()));

        let mut behaviours = self.behaviours.lock().unwrap();
        match behaviours.get_mut(&ctx.node_id) {
            None => Ok(NodeOutput::Complete(json!({ "node": ctx.node_id, "input": input }))),
            Some(MockBehaviour::ReturnValue(v)) => {
                Ok(NodeOutput::Complete(Self::tagged(&ctx.node_id, v)))
            }
            Some(MockBehaviour::Fail(err)) => Err(err.clone()),
            Some(MockBehaviour::FailThenReturn(errors, v)) => match errors.pop_front() {
                Some(err) => Err(err),
                None => Ok(NodeOutput::Complete(Self::tagged(&ctx.node_id, v))),
            },
            Some(MockBehaviour::Defer(delay, v)) => Ok(NodeOutput::Deferred {
                delay: *delay,
                output: Self::tagged(&ctx.node_id, v),
            }),
        }
    }
}
