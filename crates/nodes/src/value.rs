//! JSON path helpers shared by plugins and the condition evaluator.

use serde_json::Value;

use crate::ExecutionContext;

/// Walk a dot-separated path; numeric segments index arrays.
///
/// An empty path returns `root` itself.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve a data reference used in node configs:
///
/// - `input[.<path>]`: the node's assembled input
/// - `inputs[.<path>]`: the run's trigger input
/// - `steps.<nodeId>.outputs[.<path>]`: a completed step's output
pub fn resolve_reference(reference: &str, input: &Value, ctx: &ExecutionContext) -> Option<Value> {
    let (root, rest) = reference.split_once('.').unwrap_or((reference, ""));
    match root {
        "input" => get_path(input, rest).cloned(),
        "inputs" => get_path(&ctx.run_input, rest).cloned(),
        "steps" => {
            let (node_id, rest) = rest.split_once('.').unwrap_or((rest, ""));
            let output = ctx.steps.get(node_id)?;
            let path = match rest.split_once('.') {
                Some(("outputs", path)) => path,
                None if rest == "outputs" => "",
                _ => return None,
            };
            get_path(output, path).cloned()
        }
        _ => None,
    }
}

/// Numeric view of a JSON value, accepting numeric strings.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn get_path_walks_objects_and_arrays() {
        let doc = json!({ "a": { "items": [ { "id": 7 } ] } });
        assert_eq!(get_path(&doc, "a.items.0.id"), Some(&json!(7)));
        assert_eq!(get_path(&doc, "a.items.3"), None);
        assert_eq!(get_path(&doc, ""), Some(&doc));
    }

    #[test]
    fn references_resolve_against_their_roots() {
        let ctx = ExecutionContext {
            workflow_id: uuid::Uuid::nil(),
            run_id: uuid::Uuid::nil(),
            node_id: "agg".into(),
            run_input: json!({ "user": { "name": "ada" } }),
            steps: HashMap::from([("fetch".to_string(), json!({ "status": 200 }))]),
            attempt: 1,
        };
        let input = json!({ "text": "hi" });

        assert_eq!(resolve_reference("input.text", &input, &ctx), Some(json!("hi")));
        assert_eq!(resolve_reference("inputs.user.name", &input, &ctx), Some(json!("ada")));
        assert_eq!(resolve_reference("steps.fetch.outputs.status", &input, &ctx), Some(json!(200)));
        assert_eq!(resolve_reference("steps.fetch.outputs", &input, &ctx), Some(json!({ "status": 200 })));
        assert_eq!(resolve_reference("steps.missing.outputs", &input, &ctx), None);
        assert_eq!(resolve_reference("secrets.key", &input, &ctx), None);
    }
}
