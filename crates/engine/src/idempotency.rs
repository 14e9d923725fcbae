//! Idempotency checksums and prior-result reuse.
//!
//! A step's checksum is a SHA-256 over the canonical JSON of
//! `{runId, nodeId, input, pluginVersion}`. Canonical means object keys are
//! sorted recursively, so inputs that differ only in key order hash the same.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use db::{DbError, Store, models::StepStatus};

/// Serialize `value` with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex-encoded checksum of one step execution's inputs.
pub fn checksum(run_id: Uuid, node_id: &str, input: &Value, plugin_version: &str) -> String {
    let payload = serde_json::json!({
        "runId": run_id.to_string(),
        "nodeId": node_id,
        "input": input,
        "pluginVersion": plugin_version,
    });
    hex::encode(Sha256::digest(canonical_json(&payload).as_bytes()))
}

/// Outcome of [`check_idempotency`].
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyCheck {
    pub reuse: bool,
    pub output: Option<Value>,
}

/// Reuse is signalled when the step already succeeded with the same checksum.
pub async fn check_idempotency(
    store: &dyn Store,
    run_id: Uuid,
    node_id: &str,
    checksum: &str,
) -> Result<IdempotencyCheck, DbError> {
    let step = store.get_step(run_id, node_id).await?;
    let reuse = step.status == StepStatus::Success && step.execution_key.as_deref() == Some(checksum);
    Ok(IdempotencyCheck {
        reuse,
        output: if reuse { step.output } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{MemoryStore, models::{NewRun, StepUpdate}};
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({ "b": [ { "z": 1, "a": null } ], "a": "x\"y" });
        assert_eq!(canonical_json(&value), r#"{"a":"x\"y","b":[{"a":null,"z":1}]}"#);
    }

    #[test]
    fn checksum_ignores_key_order_but_not_content() {
        let run = Uuid::new_v4();
        let one = checksum(run, "n", &json!({ "a": 1, "b": { "c": 2, "d": 3 } }), "builtin");
        let two = checksum(run, "n", &json!({ "b": { "d": 3, "c": 2 }, "a": 1 }), "builtin");
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);

        assert_ne!(one, checksum(run, "n", &json!({ "a": 2, "b": { "c": 2, "d": 3 } }), "builtin"));
        assert_ne!(one, checksum(run, "other", &json!({ "a": 1, "b": { "c": 2, "d": 3 } }), "builtin"));
        assert_ne!(one, checksum(run, "n", &json!({ "a": 1, "b": { "c": 2, "d": 3 } }), "1.2.0"));
    }

    #[tokio::test]
    async fn reuse_requires_success_and_matching_checksum() {
        let store = MemoryStore::new();
        let version = store
            .create_workflow_version(Uuid::new_v4(), "wf", json!({}))
            .await
            .unwrap();
        let run = store
            .create_run(
                NewRun {
                    workflow_id: version.workflow_id,
                    workflow_version_id: version.id,
                    input: json!({}),
                    metadata: json!({}),
                },
                &["a".to_string()],
            )
            .await
            .unwrap();

        let pending = check_idempotency(&store, run.id, "a", "abc").await.unwrap();
        assert!(!pending.reuse);

        store
            .update_step(
                run.id,
                "a",
                &[StepStatus::Pending],
                StepUpdate::to(StepStatus::Success).execution_key("abc").output(json!({ "ok": true })),
            )
            .await
            .unwrap();

        let hit = check_idempotency(&store, run.id, "a", "abc").await.unwrap();
        assert_eq!(hit, IdempotencyCheck { reuse: true, output: Some(json!({ "ok": true })) });

        let miss = check_idempotency(&store, run.id, "a", "def").await.unwrap();
        assert_eq!(miss, IdempotencyCheck { reuse: false, output: None });
    }
}
