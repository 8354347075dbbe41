//! Workflow validation
//!
//! Produces a list of issues for a (workflow, registry snapshot) pair
//! without mutating either. The executor does not re-run validation; it
//! surfaces problems as per-node errors instead, so everything here is
//! advisory for the canvas.
//!
//! Issues come out in a deterministic order: errors, then warnings, then
//! infos; within a level, workflow-wide issues first, then by node id.

use std::collections::{HashMap, HashSet};

use patchflow_core::spec::tags_compatible;
use patchflow_core::workflow::{NodeId, Workflow, WorkflowNode};
use serde::Serialize;

use crate::registry::{is_loop_type, RegistrySnapshot, LOOP_END, LOOP_GROUP, LOOP_NODE, LOOP_START};

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Error,
    Warning,
    Info,
}

impl IssueLevel {
    fn rank(self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Warning => 1,
            Self::Info => 2,
        }
    }
}

/// One validation finding
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub level: IssueLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub message: String,
}

impl Issue {
    fn error(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            node_id: Some(node_id.to_string()),
            message: message.into(),
        }
    }

    fn info(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Info,
            node_id: Some(node_id.to_string()),
            message: message.into(),
        }
    }
}

/// Input ports fed by the loop drivers rather than edges; required-input
/// checking must not demand connections for them
fn driver_fed_ports(node_type: &str) -> &'static [&'static str] {
    match node_type {
        LOOP_END => &["in_1", "in_2", "in_3"],
        LOOP_NODE => &["feedback_1", "feedback_2", "feedback_3"],
        _ => &[],
    }
}

/// Validate a workflow against a registry snapshot
pub fn validate_workflow(workflow: &Workflow, snapshot: &RegistrySnapshot) -> Vec<Issue> {
    let mut issues = Vec::new();
    if workflow.nodes.is_empty() {
        return issues;
    }

    let nodes_by_id: HashMap<&str, &WorkflowNode> =
        workflow.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    check_node_types(workflow, snapshot, &mut issues);
    check_edges(workflow, snapshot, &nodes_by_id, &mut issues);
    check_required_inputs(workflow, snapshot, &mut issues);
    check_cycles(workflow, &mut issues);
    check_loop_pairing(workflow, &mut issues);
    check_parent_links(workflow, &nodes_by_id, &mut issues);
    check_isolated_nodes(workflow, &mut issues);
    check_muted_nodes(workflow, &mut issues);
    check_loop_node_feedback(workflow, &mut issues);

    issues.sort_by(|a, b| {
        (a.level.rank(), a.node_id.as_deref().unwrap_or(""))
            .cmp(&(b.level.rank(), b.node_id.as_deref().unwrap_or("")))
    });
    issues
}

/// Check 1: every node type exists in the registry or is a loop construct
fn check_node_types(workflow: &Workflow, snapshot: &RegistrySnapshot, issues: &mut Vec<Issue>) {
    for node in &workflow.nodes {
        if !snapshot.contains(&node.node_type) && !is_loop_type(&node.node_type) {
            issues.push(Issue::error(
                Some(node.id.as_str()),
                format!("Unknown node type '{}'", node.node_type),
            ));
        }
    }
}

/// Check 2: edge endpoints exist and name declared ports.
/// Check 4: connected port type tags are compatible (warning otherwise).
fn check_edges(
    workflow: &Workflow,
    snapshot: &RegistrySnapshot,
    nodes_by_id: &HashMap<&str, &WorkflowNode>,
    issues: &mut Vec<Issue>,
) {
    for edge in &workflow.edges {
        let source = nodes_by_id.get(edge.source.as_str());
        let target = nodes_by_id.get(edge.target.as_str());
        if source.is_none() {
            issues.push(Issue::error(
                None,
                format!("Edge '{}' references unknown source node '{}'", edge.id, edge.source),
            ));
        }
        if target.is_none() {
            issues.push(Issue::error(
                None,
                format!("Edge '{}' references unknown target node '{}'", edge.id, edge.target),
            ));
        }
        let (Some(source), Some(target)) = (source, target) else {
            continue;
        };

        // Loop construct ports are convention-named, not declared
        let source_spec = (!is_loop_type(&source.node_type))
            .then(|| snapshot.spec(&source.node_type))
            .flatten();
        let target_spec = (!is_loop_type(&target.node_type))
            .then(|| snapshot.spec(&target.node_type))
            .flatten();

        let mut source_tag = None;
        if let Some(spec) = source_spec {
            match spec.output(&edge.source_port) {
                Some(port) => source_tag = Some(port.data_type.clone()),
                None => issues.push(Issue::error(
                    Some(source.id.as_str()),
                    format!(
                        "Edge '{}' leaves undeclared output port '{}' on node '{}'",
                        edge.id, edge.source_port, source.id
                    ),
                )),
            }
        }

        let mut target_tag = None;
        if let Some(spec) = target_spec {
            match spec.input(&edge.target_port) {
                Some(port) => target_tag = Some(port.data_type.clone()),
                None => issues.push(Issue::error(
                    Some(target.id.as_str()),
                    format!(
                        "Edge '{}' enters undeclared input port '{}' on node '{}'",
                        edge.id, edge.target_port, target.id
                    ),
                )),
            }
        }

        if let (Some(src), Some(tgt)) = (source_tag, target_tag) {
            if !tags_compatible(&src, &tgt) {
                issues.push(Issue::warning(
                    &target.id,
                    format!(
                        "Edge '{}' connects port types {} -> {}",
                        edge.id, src, tgt
                    ),
                ));
            }
        }
    }
}

/// Check 3: required input ports are connected, parameterized or defaulted
fn check_required_inputs(
    workflow: &Workflow,
    snapshot: &RegistrySnapshot,
    issues: &mut Vec<Issue>,
) {
    let mut connected: HashSet<(&str, &str)> = HashSet::new();
    for edge in &workflow.edges {
        connected.insert((edge.target.as_str(), edge.target_port.as_str()));
    }

    for node in &workflow.nodes {
        let Some(spec) = snapshot.spec(&node.node_type) else {
            continue;
        };
        let driver_fed = driver_fed_ports(&node.node_type);
        for port in &spec.inputs {
            if !port.required || port.default.is_some() {
                continue;
            }
            if driver_fed.contains(&port.name.as_str()) {
                continue;
            }
            let has_edge = connected.contains(&(node.id.as_str(), port.name.as_str()));
            let has_param = node.params.get(&port.name).is_some_and(|v| !v.is_null());
            if !has_edge && !has_param {
                issues.push(Issue::error(
                    Some(node.id.as_str()),
                    format!("Required input port '{}' has no incoming connection", port.name),
                ));
            }
        }
    }
}

/// Check 5: the non-back-edge graph over top-level nodes is acyclic
fn check_cycles(workflow: &Workflow, issues: &mut Vec<Issue>) {
    let top_ids: HashSet<&str> = workflow
        .top_level_nodes()
        .map(|n| n.id.as_str())
        .collect();

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        if edge.is_back_edge {
            continue;
        }
        if top_ids.contains(edge.source.as_str()) && top_ids.contains(edge.target.as_str()) {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    if let Some(offender) = find_cycle_member(&top_ids, &adjacency, workflow) {
        issues.push(Issue::error(
            Some(offender),
            format!("Workflow contains a cycle through node '{offender}'"),
        ));
    }
}

/// DFS with coloring; returns a node on a cycle, if any
fn find_cycle_member<'a>(
    ids: &HashSet<&'a str>,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    workflow: &'a Workflow,
) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs<'a>(
        node: &'a str,
        color: &mut HashMap<&'a str, Color>,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
    ) -> Option<&'a str> {
        color.insert(node, Color::Gray);
        for &next in adjacency.get(node).into_iter().flatten() {
            match color.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => return Some(next),
                Color::White => {
                    if let Some(found) = dfs(next, color, adjacency) {
                        return Some(found);
                    }
                }
                Color::Black => {}
            }
        }
        color.insert(node, Color::Black);
        None
    }

    let mut color: HashMap<&str, Color> = HashMap::new();
    // Visit in workflow order for deterministic reporting
    for node in workflow.nodes.iter().filter(|n| ids.contains(n.id.as_str())) {
        if color.get(node.id.as_str()).copied().unwrap_or(Color::White) == Color::White {
            if let Some(found) = dfs(node.id.as_str(), &mut color, adjacency) {
                return Some(found);
            }
        }
    }
    None
}

/// Check 6: loop_start / loop_end pairing is one-to-one
fn check_loop_pairing(workflow: &Workflow, issues: &mut Vec<Issue>) {
    let start_ids: HashSet<&str> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type == LOOP_START)
        .map(|n| n.id.as_str())
        .collect();

    let mut paired: HashSet<&str> = HashSet::new();
    for node in workflow.nodes.iter().filter(|n| n.node_type == LOOP_END) {
        let pair_id = node.params.get("pair_id").and_then(|v| v.as_str());
        match pair_id {
            Some(pid) if start_ids.contains(pid) && !paired.contains(pid) => {
                paired.insert(pid);
            }
            Some(pid) if paired.contains(pid) => {
                issues.push(Issue::error(
                    Some(node.id.as_str()),
                    format!("Loop end pair_id '{pid}' is already claimed by another loop end"),
                ));
            }
            other => {
                issues.push(Issue::error(
                    Some(node.id.as_str()),
                    format!(
                        "Loop end pair_id '{}' does not match any loop start",
                        other.unwrap_or("")
                    ),
                ));
            }
        }
    }

    for start_id in start_ids {
        if !paired.contains(start_id) {
            issues.push(Issue::error(
                Some(start_id),
                "Loop start has no matching loop end (set pair_id on the loop end)",
            ));
        }
    }
}

/// Check 7: parent_id references point at loop_group nodes
fn check_parent_links(
    workflow: &Workflow,
    nodes_by_id: &HashMap<&str, &WorkflowNode>,
    issues: &mut Vec<Issue>,
) {
    for node in &workflow.nodes {
        let Some(parent_id) = node.parent_id.as_deref() else {
            continue;
        };
        match nodes_by_id.get(parent_id) {
            Some(parent) if parent.node_type == LOOP_GROUP => {}
            Some(parent) => issues.push(Issue::error(
                Some(node.id.as_str()),
                format!(
                    "Node '{}' has parent '{}' of type '{}', expected a loop group",
                    node.id, parent_id, parent.node_type
                ),
            )),
            None => issues.push(Issue::error(
                Some(node.id.as_str()),
                format!("Node '{}' references unknown parent '{parent_id}'", node.id),
            )),
        }
    }
}

/// Check 8: nodes with no incident edges, in a multi-node workflow
fn check_isolated_nodes(workflow: &Workflow, issues: &mut Vec<Issue>) {
    if workflow.nodes.len() <= 1 {
        return;
    }
    let mut touched: HashSet<&str> = HashSet::new();
    for edge in &workflow.edges {
        touched.insert(edge.source.as_str());
        touched.insert(edge.target.as_str());
    }
    for node in &workflow.nodes {
        if is_loop_type(&node.node_type) {
            continue;
        }
        if !touched.contains(node.id.as_str()) {
            issues.push(Issue::warning(
                &node.id,
                format!("Node '{}' is isolated (no connections)", node.id),
            ));
        }
    }
}

/// Check 9: note every muted node
fn check_muted_nodes(workflow: &Workflow, issues: &mut Vec<Issue>) {
    for node in &workflow.nodes {
        if node.muted {
            issues.push(Issue::info(
                &node.id,
                format!("Node '{}' is muted and will pass inputs through", node.id),
            ));
        }
    }
}

/// Check 11: a loop_node without feedback repeats the same data
fn check_loop_node_feedback(workflow: &Workflow, issues: &mut Vec<Issue>) {
    let back_edge_targets: HashSet<&str> = workflow
        .edges
        .iter()
        .filter(|e| e.is_back_edge)
        .map(|e| e.target.as_str())
        .collect();
    for node in &workflow.nodes {
        if node.node_type == LOOP_NODE && !back_edge_targets.contains(node.id.as_str()) {
            issues.push(Issue::warning(
                &node.id,
                "Loop node has no feedback back-edges (loop will repeat the same data)",
            ));
        }
    }
}
