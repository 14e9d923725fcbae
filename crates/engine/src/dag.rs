//! DAG validation and compilation: run this before persisting or executing
//! a workflow.
//!
//! Rules enforced, in order:
//! 1. At least one node; node IDs unique.
//! 2. Every edge references existing nodes; no self-loops.
//! 3. The directed graph is acyclic (iterative DFS with an explicit stack).
//! 4. With more than one node, every node has at least one edge.
//! 5. Every IF node has exactly two outgoing edges, one labelled true and
//!    one labelled false.
//! 6. Per-kind config shape and workflow settings.
//!
//! [`compile`] turns a valid definition into a [`DagRuntime`]: adjacency in
//! both directions, a deterministic topological order, resolved retry
//! configuration and pre-parsed IF conditions.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;

use nodes::{data_aggregator::AggregateOperation, text_transform::TextOperation};

use crate::{
    ValidationError,
    expr::Expr,
    models::{NodeConfig, NodeKind, RetryConfig, WorkflowDefinition, WorkflowSettings},
};

/// Parse the stored JSON form of a definition.
pub fn parse_definition(value: &Value) -> Result<WorkflowDefinition, ValidationError> {
    serde_json::from_value(value.clone()).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Validate a workflow definition.
///
/// # Errors
/// The first violated rule, as a distinct [`ValidationError`] variant.
pub fn validate(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.nodes.is_empty() {
        return Err(ValidationError::Empty);
    }

    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut ids: HashSet<&str> = HashSet::with_capacity(def.nodes.len());
    for node in &def.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &def.edges {
        if !ids.contains(edge.from.as_str()) {
            return Err(ValidationError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !ids.contains(edge.to.as_str()) {
            return Err(ValidationError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
        if edge.from == edge.to {
            return Err(ValidationError::SelfLoop(edge.from.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 3. Cycle detection
    // -----------------------------------------------------------------------
    let children = adjacency(def);
    if let Some(path) = find_cycle(def, &children) {
        return Err(ValidationError::CycleDetected { path });
    }

    // -----------------------------------------------------------------------
    // 4. Disconnected nodes
    // -----------------------------------------------------------------------
    if def.nodes.len() > 1 {
        let mut touched: HashSet<&str> = HashSet::new();
        for edge in &def.edges {
            touched.insert(edge.from.as_str());
            touched.insert(edge.to.as_str());
        }
        if let Some(node) = def.nodes.iter().find(|n| !touched.contains(n.id.as_str())) {
            return Err(ValidationError::DisconnectedNode(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 5. IF branching
    // -----------------------------------------------------------------------
    for node in def.nodes.iter().filter(|n| n.kind == NodeKind::If) {
        branch_targets(def, &node.id)?;
    }

    // -----------------------------------------------------------------------
    // 6. Per-kind config and settings
    // -----------------------------------------------------------------------
    for node in &def.nodes {
        check_node_config(node, &ids)?;
    }
    check_settings(&def.settings)
}

fn adjacency(def: &WorkflowDefinition) -> HashMap<&str, Vec<&str>> {
    let mut children: HashMap<&str, Vec<&str>> =
        def.nodes.iter().map(|n| (n.id.as_str(), Vec::new())).collect();
    for edge in &def.edges {
        children.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    for list in children.values_mut() {
        list.sort_unstable();
        list.dedup();
    }
    children
}

/// Iterative three-colour DFS. Returns the cycle as a closed path
/// (`a -> b -> c -> a`) when a back-edge is found.
fn find_cycle(def: &WorkflowDefinition, children: &HashMap<&str, Vec<&str>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = children.keys().map(|&id| (id, Mark::Unvisited)).collect();
    let mut starts: Vec<&str> = def.nodes.iter().map(|n| n.id.as_str()).collect();
    starts.sort_unstable();

    for start in starts {
        if marks.get(start) != Some(&Mark::Unvisited) {
            continue;
        }
        // (node, index of the next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::OnStack);

        while let Some(&(node, next)) = stack.last() {
            let kids = children.get(node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&child) = kids.get(next) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match marks.get(child).copied().unwrap_or(Mark::Done) {
                    Mark::Unvisited => {
                        marks.insert(child, Mark::OnStack);
                        stack.push((child, 0));
                    }
                    Mark::OnStack => {
                        let from = stack.iter().position(|(id, _)| *id == child).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[from..].iter().map(|(id, _)| (*id).to_owned()).collect();
                        path.push(child.to_owned());
                        return Some(path);
                    }
                    Mark::Done => {}
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    None
}

/// The (true-branch, false-branch) children of an IF node.
fn branch_targets(def: &WorkflowDefinition, node_id: &str) -> Result<(String, String), ValidationError> {
    let invalid = |problem: String| ValidationError::InvalidBranching {
        node_id: node_id.to_owned(),
        problem,
    };

    let outgoing: Vec<_> = def.edges.iter().filter(|e| e.from == node_id).collect();
    if outgoing.len() != 2 {
        return Err(invalid(format!(
            "must have exactly two outgoing edges, found {}",
            outgoing.len()
        )));
    }

    let on_true = outgoing.iter().find(|e| e.branch() == Some(true));
    let on_false = outgoing.iter().find(|e| e.branch() == Some(false));
    match (on_true, on_false) {
        (Some(t), Some(f)) if t.to != f.to => Ok((t.to.clone(), f.to.clone())),
        (Some(_), Some(_)) => Err(invalid("routes both branches to the same node".into())),
        (None, _) => Err(invalid("is missing an edge labelled true".into())),
        (_, None) => Err(invalid("is missing an edge labelled false".into())),
    }
}

/// The condition text of an IF node (`expression`, or `condition` as an alias).
fn condition_source(node: &NodeConfig) -> Option<&str> {
    node.config
        .get("expression")
        .or_else(|| node.config.get("condition"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn check_node_config(node: &NodeConfig, ids: &HashSet<&str>) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidNodeConfig {
        node_id: node.id.clone(),
        reason,
    };
    let str_field = |key: &str| node.config.get(key).and_then(Value::as_str);

    match node.kind {
        NodeKind::ApiProxy => {
            let raw = str_field("url").ok_or_else(|| invalid("'url' is required".into()))?;
            let url = url::Url::parse(raw).map_err(|e| invalid(format!("'url' is not a valid URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!("'url' scheme '{}' is not http(s)", url.scheme())));
            }
        }
        NodeKind::Delay => {
            let ms = node.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
            if ms == 0 {
                return Err(invalid("'ms' must be a positive integer".into()));
            }
        }
        NodeKind::If => {
            let src = condition_source(node)
                .ok_or_else(|| invalid("'expression' must be a non-empty string".into()))?;
            let expr = Expr::parse(src).map_err(|source| ValidationError::InvalidCondition {
                node_id: node.id.clone(),
                source,
            })?;
            if let Some(missing) = expr.referenced_steps().into_iter().find(|id| !ids.contains(id.as_str())) {
                return Err(invalid(format!("condition references unknown step '{missing}'")));
            }
        }
        NodeKind::TextTransform => {
            let op = str_field("operation").ok_or_else(|| invalid("'operation' is required".into()))?;
            if TextOperation::parse(op).is_none() {
                return Err(invalid(format!("unknown operation '{op}'")));
            }
        }
        NodeKind::DataAggregator => {
            let op = str_field("operation").ok_or_else(|| invalid("'operation' is required".into()))?;
            if AggregateOperation::parse(op).is_none() {
                return Err(invalid(format!("unknown operation '{op}'")));
            }
        }
        NodeKind::Custom => {
            if str_field("command").map_or(true, |c| c.trim().is_empty()) {
                return Err(invalid("'command' is required".into()));
            }
        }
    }

    if let Some(retry) = node.retry_config {
        if retry.max_attempts == 0 {
            return Err(invalid("retryConfig.maxAttempts must be at least 1".into()));
        }
        if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
            return Err(invalid("retryConfig.backoffMultiplier must be >= 1".into()));
        }
    }
    Ok(())
}

fn check_settings(settings: &WorkflowSettings) -> Result<(), ValidationError> {
    if settings.max_concurrency == Some(0) {
        return Err(ValidationError::InvalidSettings("maxConcurrency must be at least 1".into()));
    }
    if settings.default_max_attempts == Some(0) {
        return Err(ValidationError::InvalidSettings("defaultMaxAttempts must be at least 1".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compiled runtime
// ---------------------------------------------------------------------------

/// A validated workflow in the shape the orchestrator works with.
///
/// Purely derived from the definition; compiling the same definition twice
/// yields equal runtimes.
#[derive(Debug, Clone)]
pub struct DagRuntime {
    nodes: HashMap<String, NodeConfig>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
    order: Vec<String>,
    retry: HashMap<String, RetryConfig>,
    conditions: HashMap<String, Expr>,
    branches: HashMap<String, (String, String)>,
    max_concurrency: Option<u32>,
}

/// Validate and compile with the built-in retry defaults.
pub fn compile(def: &WorkflowDefinition) -> Result<DagRuntime, ValidationError> {
    compile_with(def, RetryConfig::default())
}

/// Validate and compile; `system_retry` fills whatever neither the node nor
/// the workflow settings specify.
pub fn compile_with(def: &WorkflowDefinition, system_retry: RetryConfig) -> Result<DagRuntime, ValidationError> {
    validate(def)?;

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut parents: HashMap<String, Vec<String>> = HashMap::new();
    for node in &def.nodes {
        children.insert(node.id.clone(), Vec::new());
        parents.insert(node.id.clone(), Vec::new());
    }
    for edge in &def.edges {
        children.entry(edge.from.clone()).or_default().push(edge.to.clone());
        parents.entry(edge.to.clone()).or_default().push(edge.from.clone());
    }
    for list in children.values_mut().chain(parents.values_mut()) {
        list.sort_unstable();
        list.dedup();
    }

    let workflow_retry = RetryConfig {
        max_attempts: def.settings.default_max_attempts.unwrap_or(system_retry.max_attempts),
        ..system_retry
    };

    let mut retry = HashMap::new();
    let mut conditions = HashMap::new();
    let mut branches = HashMap::new();
    for node in &def.nodes {
        retry.insert(node.id.clone(), node.retry_config.unwrap_or(workflow_retry));
        if node.kind == NodeKind::If {
            // Both already checked by `validate`.
            if let Some(src) = condition_source(node) {
                let expr = Expr::parse(src).map_err(|source| ValidationError::InvalidCondition {
                    node_id: node.id.clone(),
                    source,
                })?;
                conditions.insert(node.id.clone(), expr);
            }
            branches.insert(node.id.clone(), branch_targets(def, &node.id)?);
        }
    }

    let order = topological_order(&def.nodes, &children, &parents);

    Ok(DagRuntime {
        nodes: def.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect(),
        children,
        parents,
        order,
        retry,
        conditions,
        branches,
        max_concurrency: def.settings.max_concurrency,
    })
}

/// Kahn's algorithm. The ready list is re-sorted before every pop so that
/// nodes becoming ready together always leave in id order.
fn topological_order(
    nodes: &[NodeConfig],
    children: &HashMap<String, Vec<String>>,
    parents: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| (n.id.as_str(), parents.get(&n.id).map_or(0, Vec::len)))
        .collect();

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    loop {
        // Descending, so the smallest id is at the end.
        ready.sort_unstable_by(|a, b| b.cmp(a));
        let Some(node_id) = ready.pop() else { break };
        sorted.push(node_id.to_owned());

        for child in children.get(node_id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(child.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(child.as_str());
                }
            }
        }
    }
    sorted
}

impl DagRuntime {
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node id in deterministic topological order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Direct children, sorted by id.
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Direct parents, sorted by id.
    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Nodes without incoming edges, in topological order.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.parents(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    pub fn retry_config(&self, id: &str) -> RetryConfig {
        self.retry.get(id).copied().unwrap_or_default()
    }

    pub fn condition(&self, id: &str) -> Option<&Expr> {
        self.conditions.get(id)
    }

    /// `(true_child, false_child)` of an IF node.
    pub fn branch_targets(&self, id: &str) -> Option<(&str, &str)> {
        self.branches.get(id).map(|(t, f)| (t.as_str(), f.as_str()))
    }

    pub fn max_concurrency(&self) -> Option<u32> {
        self.max_concurrency
    }

    /// All nodes reachable from `start` (inclusive), never expanding past
    /// any node in `stop_at`.
    pub fn reachable_from(&self, start: &str, stop_at: &BTreeSet<String>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = std::collections::VecDeque::from([start.to_owned()]);
        while let Some(id) = queue.pop_front() {
            if stop_at.contains(&id) || !seen.insert(id.clone()) {
                continue;
            }
            queue.extend(self.children(&id).iter().cloned());
        }
        seen
    }
}
