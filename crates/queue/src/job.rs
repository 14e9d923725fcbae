//! Step job payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One unit of work: execute `node_id` of run `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJob {
    pub run_id: Uuid,
    pub node_id: String,
    pub input: Value,
    pub retry_count: u32,
    /// Output to complete an already-running step with (deferred DELAY).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<Value>,
}

impl StepJob {
    pub fn new(run_id: Uuid, node_id: impl Into<String>, input: Value, retry_count: u32) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            input,
            retry_count,
            continuation: None,
        }
    }

    /// A job that completes the step with `output` once due.
    pub fn continuation_of(&self, output: Value) -> Self {
        Self {
            continuation: Some(output),
            ..self.clone()
        }
    }

    /// Stable deduplication key.
    pub fn key(&self) -> String {
        match self.continuation {
            Some(_) => format!("{}:{}:{}:resume", self.run_id, self.node_id, self.retry_count),
            None => format!("{}:{}:{}", self.run_id, self.node_id, self.retry_count),
        }
    }
}

/// A job claimed from the queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub key: String,
    /// Delivery count, including this one.
    pub attempts: u32,
    pub job: StepJob,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_distinguishes_retry_attempts_and_continuations() {
        let run = Uuid::new_v4();
        let first = StepJob::new(run, "fetch", json!({}), 0);
        let retry = StepJob::new(run, "fetch", json!({ "changed": true }), 1);
        let resume = first.continuation_of(json!({ "waited": 10 }));

        assert_eq!(first.key(), format!("{run}:fetch:0"));
        assert_eq!(retry.key(), format!("{run}:fetch:1"));
        assert_eq!(resume.key(), format!("{run}:fetch:0:resume"));
        // The input is not part of the key.
        assert_eq!(first.key(), StepJob::new(run, "fetch", json!({ "x": 1 }), 0).key());
    }
}
