//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow DAG looks like in
//! memory. They serialise to/from the JSONB `definition` column of the
//! `workflow_versions` table using the camelCase wire format:
//!
//! ```json
//! { "nodes": [ { "id": "a", "type": "TEXT_TRANSFORM", "config": {} } ],
//!   "edges": [ { "from": "a", "to": "b", "condition": "true" } ],
//!   "settings": { "maxConcurrency": 4, "defaultMaxAttempts": 3 } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Which plugin a node invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    TextTransform,
    ApiProxy,
    DataAggregator,
    Delay,
    /// Conditional branch, evaluated by the engine.
    If,
    /// External plugin code run in the process sandbox.
    Custom,
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Per-node retry override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Opaque configuration interpreted per node kind.
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
}

impl NodeConfig {
    /// Plugin version hashed into the idempotency checksum.
    pub fn plugin_version(&self) -> String {
        match self.kind {
            NodeKind::Custom => self
                .config
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("unversioned")
                .to_owned(),
            _ => "builtin".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionKind {
    If,
    Else,
    Always,
}

/// Branch label on an edge leaving an IF node.
///
/// Accepts `"true"` / `"false"` or `{ "type": "IF" | "ELSE" | "ALWAYS" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeCondition {
    Label(String),
    Typed {
        #[serde(rename = "type")]
        kind: ConditionKind,
    },
}

impl EdgeCondition {
    /// `Some(true)` for the taken-when-true branch, `Some(false)` for the
    /// else branch, `None` for unconditional or unrecognised labels.
    pub fn branch(&self) -> Option<bool> {
        match self {
            Self::Label(label) => match label.to_ascii_lowercase().as_str() {
                "true" | "if" => Some(true),
                "false" | "else" => Some(false),
                _ => None,
            },
            Self::Typed { kind: ConditionKind::If } => Some(true),
            Self::Typed { kind: ConditionKind::Else } => Some(false),
            Self::Typed { kind: ConditionKind::Always } => None,
        }
    }
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    pub fn labeled(from: impl Into<String>, to: impl Into<String>, branch: bool) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(EdgeCondition::Label(branch.to_string())),
        }
    }

    pub fn branch(&self) -> Option<bool> {
        self.condition.as_ref().and_then(EdgeCondition::branch)
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_attempts: Option<u32>,
}

/// A complete, immutable workflow DAG definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(nodes: Vec<NodeConfig>, edges: Vec<Edge>) -> Self {
        Self {
            nodes,
            edges,
            settings: WorkflowSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_parses_wire_format() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "nodes": [
                { "id": "check", "type": "IF", "config": { "expression": "inputs.n > 1" } },
                { "id": "yes", "type": "TEXT_TRANSFORM", "config": {},
                  "retryConfig": { "maxAttempts": 5, "backoffMs": 10, "backoffMultiplier": 3.0 } },
                { "id": "no", "type": "DELAY", "config": { "ms": 10 } }
            ],
            "edges": [
                { "from": "check", "to": "yes", "condition": "true" },
                { "from": "check", "to": "no", "condition": { "type": "ELSE" } }
            ],
            "settings": { "maxConcurrency": 2 }
        }))
        .unwrap();

        assert_eq!(def.nodes[0].kind, NodeKind::If);
        assert_eq!(def.nodes[1].retry_config.unwrap().max_attempts, 5);
        assert_eq!(def.edges[0].branch(), Some(true));
        assert_eq!(def.edges[1].branch(), Some(false));
        assert_eq!(def.settings.max_concurrency, Some(2));
    }

    #[test]
    fn plugin_version_is_builtin_except_for_custom_nodes() {
        let builtin = NodeConfig {
            id: "a".into(),
            kind: NodeKind::TextTransform,
            config: json!({ "version": "9" }),
            retry_config: None,
        };
        let custom = NodeConfig {
            kind: NodeKind::Custom,
            ..builtin.clone()
        };
        assert_eq!(builtin.plugin_version(), "builtin");
        assert_eq!(custom.plugin_version(), "9");
    }
}
