//! DELAY: wait `config.ms` milliseconds.
//!
//! Waits up to the inline threshold block the worker; longer ones return a
//! [`NodeOutput::Deferred`] so the engine schedules a continuation job and
//! the worker is freed.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutput};

pub struct DelayNode {
    inline_threshold: Duration,
}

impl DelayNode {
    pub fn new(inline_threshold: Duration) -> Self {
        Self { inline_threshold }
    }
}

#[async_trait]
impl ExecutableNode for DelayNode {
    async fn execute(
        &self,
        config: &Value,
        input: Value,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let ms = config
            .get("ms")
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .ok_or_else(|| NodeError::invalid_config("DELAY", "'ms' must be a positive integer"))?;
        let delay = Duration::from_millis(ms);
        let output = json!({ "delayedMs": ms, "data": input });

        if delay <= self.inline_threshold {
            tokio::time::sleep(delay).await;
            return Ok(NodeOutput::Complete(output));
        }
        Ok(NodeOutput::Deferred { delay, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_id: uuid::Uuid::nil(),
            run_id: uuid::Uuid::nil(),
            node_id: "wait".into(),
            run_input: Value::Null,
            steps: HashMap::new(),
            attempt: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_delay_sleeps_inline() {
        let node = DelayNode::new(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let out = node.execute(&json!({ "ms": 1500 }), json!(1), &ctx()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(out, NodeOutput::Complete(json!({ "delayedMs": 1500, "data": 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn long_delay_is_deferred_without_blocking() {
        let node = DelayNode::new(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let out = node.execute(&json!({ "ms": 60_000 }), Value::Null, &ctx()).await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(matches!(out, NodeOutput::Deferred { delay, .. } if delay == Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn non_positive_delay_is_rejected() {
        let node = DelayNode::new(Duration::from_secs(5));
        assert!(node.execute(&json!({ "ms": 0 }), Value::Null, &ctx()).await.is_err());
    }
}
