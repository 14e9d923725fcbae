//! IF-node branch selection and skip propagation.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::{
    dag::DagRuntime,
    expr::{EvalContext, Expr, ExpressionError},
};

/// Evaluate an IF condition against completed step outputs and run input.
pub fn evaluate(expr: &Expr, steps: &HashMap<String, Value>, inputs: &Value) -> Result<bool, ExpressionError> {
    expr.evaluate_bool(&EvalContext { steps, inputs })
}

/// The branch an IF node took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchDecision {
    /// Root of the taken branch.
    pub selected: String,
    /// Root of the branch not taken.
    pub skipped: String,
}

/// Pick the taken and not-taken branch roots of `if_node_id`.
///
/// Returns `None` when the node is not a compiled IF node.
pub fn determine_branch(dag: &DagRuntime, if_node_id: &str, condition: bool) -> Option<BranchDecision> {
    let (on_true, on_false) = dag.branch_targets(if_node_id)?;
    let (selected, skipped) = if condition {
        (on_true, on_false)
    } else {
        (on_false, on_true)
    };
    Some(BranchDecision {
        selected: selected.to_owned(),
        skipped: skipped.to_owned(),
    })
}

/// Nodes to mark SKIPPED when `skipped_root`'s branch is not taken.
///
/// Anything reachable from `selected_root` must still run, so the walk from
/// `skipped_root` neither marks nor expands past those nodes.
pub fn compute_skipped_nodes(dag: &DagRuntime, skipped_root: &str, selected_root: &str) -> BTreeSet<String> {
    let keep = dag.reachable_from(selected_root, &BTreeSet::new());
    dag.reachable_from(skipped_root, &keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::compile;
    use crate::models::{Edge, NodeConfig, NodeKind, WorkflowDefinition};
    use serde_json::json;

    fn text(id: &str) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            kind: NodeKind::TextTransform,
            config: json!({ "operation": "reverse" }),
            retry_config: None,
        }
    }

    fn gate() -> NodeConfig {
        NodeConfig {
            id: "gate".into(),
            kind: NodeKind::If,
            config: json!({ "expression": "inputs.amount > 100" }),
            retry_config: None,
        }
    }

    /// gate -> {t, f}; t -> d; f -> d; f -> only_f -> tail
    fn diamond() -> DagRuntime {
        compile(&WorkflowDefinition::new(
            vec![gate(), text("t"), text("f"), text("d"), text("only_f"), text("tail")],
            vec![
                Edge::labeled("gate", "t", true),
                Edge::labeled("gate", "f", false),
                Edge::new("t", "d"),
                Edge::new("f", "d"),
                Edge::new("f", "only_f"),
                Edge::new("only_f", "tail"),
            ],
        ))
        .unwrap()
    }

    #[test]
    fn branch_follows_the_condition() {
        let dag = diamond();
        let steps = HashMap::new();
        let taken = evaluate(dag.condition("gate").unwrap(), &steps, &json!({ "amount": 150 })).unwrap();
        assert!(taken);

        assert_eq!(
            determine_branch(&dag, "gate", true),
            Some(BranchDecision { selected: "t".into(), skipped: "f".into() })
        );
        assert_eq!(
            determine_branch(&dag, "gate", false),
            Some(BranchDecision { selected: "f".into(), skipped: "t".into() })
        );
        assert_eq!(determine_branch(&dag, "t", true), None);
    }

    #[test]
    fn reconverging_nodes_are_not_skipped() {
        let dag = diamond();
        let skipped: Vec<String> = compute_skipped_nodes(&dag, "f", "t").into_iter().collect();
        assert_eq!(skipped, vec!["f", "only_f", "tail"]);

        let skipped: Vec<String> = compute_skipped_nodes(&dag, "t", "f").into_iter().collect();
        assert_eq!(skipped, vec!["t"]);
    }
}
