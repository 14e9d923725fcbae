//! DATA_AGGREGATOR: merge / pick / omit / map / filter / reduce / flatten
//! over step outputs and run input.
//!
//! The operand is `config.source`, a reference (`input…`, `inputs…`,
//! `steps.<id>.outputs…`); it defaults to the node's own input. `merge`
//! takes a list in `config.sources` instead.
//!
//! `merge`, `pick` and `omit` output the resulting object; the others output
//! `{ "result": … }`.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{
    value::{as_f64, get_path, resolve_reference},
    ExecutableNode, ExecutionContext, NodeError, NodeOutput,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOperation {
    Merge,
    Pick,
    Omit,
    Map,
    Filter,
    Reduce,
    Flatten,
}

impl AggregateOperation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "merge" => Some(Self::Merge),
            "pick" => Some(Self::Pick),
            "omit" => Some(Self::Omit),
            "map" => Some(Self::Map),
            "filter" => Some(Self::Filter),
            "reduce" => Some(Self::Reduce),
            "flatten" => Some(Self::Flatten),
            _ => None,
        }
    }
}

pub struct DataAggregatorNode;

fn invalid(detail: impl std::fmt::Display) -> NodeError {
    NodeError::invalid_config("DATA_AGGREGATOR", detail)
}

fn resolve(reference: &str, input: &Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
    resolve_reference(reference, input, ctx)
        .ok_or_else(|| NodeError::Permanent(format!("invalid reference: '{reference}' not found")))
}

fn source(config: &Value, input: &Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
    match config.get("source").and_then(Value::as_str) {
        Some(reference) => resolve(reference, input, ctx),
        None => Ok(input.clone()),
    }
}

fn source_array(config: &Value, input: &Value, ctx: &ExecutionContext) -> Result<Vec<Value>, NodeError> {
    match source(config, input, ctx)? {
        Value::Array(items) => Ok(items),
        other => Err(NodeError::Permanent(format!(
            "invalid operand: expected an array, got {}",
            type_name(&other)
        ))),
    }
}

fn source_object(config: &Value, input: &Value, ctx: &ExecutionContext) -> Result<Map<String, Value>, NodeError> {
    match source(config, input, ctx)? {
        Value::Object(map) => Ok(map),
        other => Err(NodeError::Permanent(format!(
            "invalid operand: expected an object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string_list(config: &Value, key: &str) -> Result<Vec<String>, NodeError> {
    config
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("'{key}' must be an array of strings")))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| invalid(format!("'{key}' must be an array of strings")))
        })
        .collect()
}

fn merge(config: &Value, input: &Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
    let operands: Vec<Value> = match config.get("sources").and_then(Value::as_array) {
        Some(refs) => refs
            .iter()
            .map(|r| {
                let r = r.as_str().ok_or_else(|| invalid("'sources' must be references"))?;
                resolve(r, input, ctx)
            })
            .collect::<Result<_, _>>()?,
        // Fan-in input: an object of parent outputs keyed by parent id.
        None => match input {
            Value::Object(map) if !map.is_empty() && map.values().all(Value::is_object) => {
                map.values().cloned().collect()
            }
            other => vec![other.clone()],
        },
    };

    let mut merged = Map::new();
    for operand in operands {
        match operand {
            Value::Object(map) => merged.extend(map),
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(map) = item {
                        merged.extend(map);
                    }
                }
            }
            Value::Null => {}
            other => {
                return Err(NodeError::Permanent(format!(
                    "invalid operand: cannot merge {}",
                    type_name(&other)
                )))
            }
        }
    }
    Ok(Value::Object(merged))
}

fn matches_condition(item: &Value, condition: &Value) -> Result<bool, NodeError> {
    let field = condition.get("field").and_then(Value::as_str).unwrap_or("");
    let op = condition
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or("eq");
    let expected = condition.get("value").unwrap_or(&Value::Null);
    let actual = get_path(item, field);

    let numeric = || match (actual.and_then(as_f64), as_f64(expected)) {
        (Some(a), Some(b)) => Some((a, b)),
        _ => None,
    };

    Ok(match op {
        "eq" => actual == Some(expected) || numeric().is_some_and(|(a, b)| a == b),
        "ne" => !(actual == Some(expected) || numeric().is_some_and(|(a, b)| a == b)),
        "gt" => numeric().is_some_and(|(a, b)| a > b),
        "gte" => numeric().is_some_and(|(a, b)| a >= b),
        "lt" => numeric().is_some_and(|(a, b)| a < b),
        "lte" => numeric().is_some_and(|(a, b)| a <= b),
        "exists" => actual.is_some_and(|v| !v.is_null()),
        "contains" => match (actual, expected) {
            (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), needle) => items.contains(needle),
            _ => false,
        },
        other => return Err(invalid(format!("unknown filter operator '{other}'"))),
    })
}

fn reduce(items: &[Value], config: &Value) -> Result<Value, NodeError> {
    let reducer = config
        .get("reducer")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing 'reducer'"))?;
    let field = config.get("field").and_then(Value::as_str).unwrap_or("");
    let values: Vec<&Value> = items.iter().filter_map(|i| get_path(i, field)).collect();
    let numbers = || values.iter().filter_map(|v| as_f64(v)).collect::<Vec<f64>>();

    Ok(match reducer {
        "count" => json!(values.len()),
        "sum" => json!(numbers().iter().sum::<f64>()),
        "avg" => {
            let nums = numbers();
            if nums.is_empty() {
                Value::Null
            } else {
                json!(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "min" => numbers().into_iter().reduce(f64::min).map_or(Value::Null, |n| json!(n)),
        "max" => numbers().into_iter().reduce(f64::max).map_or(Value::Null, |n| json!(n)),
        "concat" => Value::Array(
            values
                .iter()
                .flat_map(|v| match v {
                    Value::Array(inner) => inner.clone(),
                    other => vec![(*other).clone()],
                })
                .collect(),
        ),
        "join" => {
            let separator = config.get("separator").and_then(Value::as_str).unwrap_or(",");
            let parts: Vec<String> = values
                .iter()
                .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
                .collect();
            json!(parts.join(separator))
        }
        other => return Err(invalid(format!("unknown reducer '{other}'"))),
    })
}

fn flatten(items: Vec<Value>, depth: u64) -> Vec<Value> {
    if depth == 0 {
        return items;
    }
    items
        .into_iter()
        .flat_map(|item| match item {
            Value::Array(inner) => flatten(inner, depth - 1),
            other => vec![other],
        })
        .collect()
}

#[async_trait]
impl ExecutableNode for DataAggregatorNode {
    async fn execute(
        &self,
        config: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let op_name = config
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'operation'"))?;
        let operation =
            AggregateOperation::parse(op_name).ok_or_else(|| invalid(format!("unknown operation '{op_name}'")))?;

        let output = match operation {
            AggregateOperation::Merge => merge(config, &input, ctx)?,
            AggregateOperation::Pick => {
                let fields = string_list(config, "fields")?;
                let object = source_object(config, &input, ctx)?;
                Value::Object(
                    object
                        .into_iter()
                        .filter(|(k, _)| fields.contains(k))
                        .collect(),
                )
            }
            AggregateOperation::Omit => {
                let fields = string_list(config, "fields")?;
                let object = source_object(config, &input, ctx)?;
                Value::Object(
                    object
                        .into_iter()
                        .filter(|(k, _)| !fields.contains(k))
                        .collect(),
                )
            }
            AggregateOperation::Map => {
                let items = source_array(config, &input, ctx)?;
                let mapped: Vec<Value> = if let Some(mapping) = config.get("mapping").and_then(Value::as_object) {
                    items
                        .iter()
                        .map(|item| {
                            let object: Map<String, Value> = mapping
                                .iter()
                                .map(|(out, path)| {
                                    let value = path
                                        .as_str()
                                        .and_then(|p| get_path(item, p))
                                        .cloned()
                                        .unwrap_or(Value::Null);
                                    (out.clone(), value)
                                })
                                .collect();
                            Value::Object(object)
                        })
                        .collect()
                } else if let Some(field) = config.get("field").and_then(Value::as_str) {
                    items
                        .iter()
                        .map(|item| get_path(item, field).cloned().unwrap_or(Value::Null))
                        .collect()
                } else {
                    return Err(invalid("map requires 'mapping' or 'field'"));
                };
                json!({ "result": mapped })
            }
            AggregateOperation::Filter => {
                let condition = config
                    .get("where")
                    .ok_or_else(|| invalid("filter requires 'where'"))?;
                let mut kept = Vec::new();
                for item in source_array(config, &input, ctx)? {
                    if matches_condition(&item, condition)? {
                        kept.push(item);
                    }
                }
                json!({ "result": kept })
            }
            AggregateOperation::Reduce => {
                let items = source_array(config, &input, ctx)?;
                json!({ "result": reduce(&items, config)? })
            }
            AggregateOperation::Flatten => {
                let depth = config.get("depth").and_then(Value::as_u64).unwrap_or(1);
                let items = source_array(config, &input, ctx)?;
                json!({ "result": flatten(items, depth) })
            }
        };

        Ok(NodeOutput::Complete(output))
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
            node_id: "agg".into(),
            run_input: json!({ "region": "eu" }),
            steps: HashMap::from([(
                "orders".to_string(),
                json!({ "items": [
                    { "id": 1, "total": 10, "tags": ["a"] },
                    { "id": 2, "total": 25, "tags": ["b", "c"] },
                    { "id": 3, "total": 5,  "tags": [] }
                ] }),
            )]),
            attempt: 1,
        }
    }

    async fn run(config: Value, input: Value) -> Value {
        match DataAggregatorNode.execute(&config, input, &ctx()).await.unwrap() {
            NodeOutput::Complete(v) => v,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[tokio::test]
    async fn merge_combines_fan_in_parents_and_references() {
        let fan_in = json!({ "a": { "x": 1 }, "b": { "y": 2 } });
        assert_eq!(run(json!({ "operation": "merge" }), fan_in).await, json!({ "x": 1, "y": 2 }));

        let merged = run(
            json!({ "operation": "merge", "sources": ["inputs", "input"] }),
            json!({ "user": "ada" }),
        )
        .await;
        assert_eq!(merged, json!({ "region": "eu", "user": "ada" }));
    }

    #[tokio::test]
    async fn pick_and_omit_select_keys() {
        let input = json!({ "a": 1, "b": 2, "c": 3 });
        assert_eq!(run(json!({ "operation": "pick", "fields": ["a", "c"] }), input.clone()).await, json!({ "a": 1, "c": 3 }));
        assert_eq!(run(json!({ "operation": "omit", "fields": ["a"] }), input).await, json!({ "b": 2, "c": 3 }));
    }

    #[tokio::test]
    async fn map_filter_reduce_over_step_output() {
        let source = "steps.orders.outputs.items";
        let ids = run(json!({ "operation": "map", "source": source, "field": "id" }), Value::Null).await;
        assert_eq!(ids, json!({ "result": [1, 2, 3] }));

        let big = run(
            json!({ "operation": "filter", "source": source,
                    "where": { "field": "total", "operator": "gte", "value": 10 } }),
            Value::Null,
        )
        .await;
        assert_eq!(big["result"].as_array().unwrap().len(), 2);

        let sum = run(
            json!({ "operation": "reduce", "source": source, "reducer": "sum", "field": "total" }),
            Value::Null,
        )
        .await;
        assert_eq!(sum, json!({ "result": 40.0 }));
    }

    #[tokio::test]
    async fn flatten_respects_depth() {
        let input = json!([[1, [2]], [3]]);
        assert_eq!(run(json!({ "operation": "flatten" }), input.clone()).await, json!({ "result": [1, [2], 3] }));
        assert_eq!(run(json!({ "operation": "flatten", "depth": 2 }), input).await, json!({ "result": [1, 2, 3] }));
    }

    #[tokio::test]
    async fn non_array_operand_is_permanent_error() {
        let err = DataAggregatorNode
            .execute(&json!({ "operation": "flatten" }), json!({ "a": 1 }), &ctx())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
