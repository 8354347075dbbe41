//! Workflow definitions as edited on the canvas
//!
//! A workflow is the persisted form of what the user draws: a list of
//! typed nodes and a list of directed edges between named ports. The
//! executor derives scheduling order from this; the order of the lists
//! themselves carries no execution meaning but is preserved on round-trip,
//! along with any fields this version of the engine does not know about.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Node position on the canvas (x, y)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node instance in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier for this node instance
    pub id: NodeId,
    /// Node type, naming a registry entry or a built-in loop construct
    #[serde(rename = "type")]
    pub node_type: String,
    /// Canvas position; absent for programmatically built workflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Scalar/config inputs keyed by port name
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Containing loop-group node id, if this node lives inside one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    /// Muted nodes are skipped and pass their inputs through
    #[serde(default, skip_serializing_if = "is_false")]
    pub muted: bool,
    /// Fields this engine version does not interpret, kept for round-trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: None,
            params: Map::new(),
            parent_id: None,
            muted: false,
            extra: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn muted(mut self) -> Self {
        self.muted = true;
        self
    }
}

/// A directed connection from an output port to an input port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Unique identifier for this edge
    pub id: EdgeId,
    /// Source node ID
    pub source: NodeId,
    /// Source port name
    pub source_port: String,
    /// Target node ID
    pub target: NodeId,
    /// Target port name
    pub target_port: String,
    /// Back-edges carry loop feedback and are excluded from cycle checks
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_back_edge: bool,
    /// Fields this engine version does not interpret, kept for round-trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowEdge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
            is_back_edge: false,
            extra: Map::new(),
        }
    }

    pub fn back_edge(mut self) -> Self {
        self.is_back_edge = true;
        self
    }
}

/// A complete workflow definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Human-readable name
    #[serde(default = "default_workflow_name")]
    pub name: String,
    /// Nodes, in canvas order
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    /// Edges, in insertion order (the stacking tie-breaker)
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Fields this engine version does not interpret, kept for round-trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Workflow {
    /// Create a new empty workflow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Get edges coming into a node
    pub fn incoming_edges<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Get edges going out of a node
    pub fn outgoing_edges<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Nodes not contained in any loop group
    pub fn top_level_nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.iter().filter(|n| n.parent_id.is_none())
    }

    /// Nodes whose `parent_id` points at the given loop group
    pub fn children_of<'a>(
        &'a self,
        parent_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowNode> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.parent_id.as_deref() == Some(parent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adjacency_helpers() {
        let wf = Workflow::new("test")
            .add_node(WorkflowNode::new("a", "gen"))
            .add_node(WorkflowNode::new("b", "double"))
            .add_edge(WorkflowEdge::new("e1", "a", "out", "b", "in"));

        let incoming: Vec<_> = wf.incoming_edges("b").collect();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, "a");

        let outgoing: Vec<_> = wf.outgoing_edges("a").collect();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target, "b");
    }

    #[test]
    fn test_children_of() {
        let wf = Workflow::new("test")
            .add_node(WorkflowNode::new("loop", "loop_group"))
            .add_node(WorkflowNode::new("child", "double").with_parent("loop"))
            .add_node(WorkflowNode::new("outside", "gen"));

        let children: Vec<_> = wf.children_of("loop").collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "child");

        let top: Vec<_> = wf.top_level_nodes().collect();
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn test_round_trip_preserves_fields_and_order() {
        let raw = json!({
            "name": "sorting demo",
            "nodes": [
                {"id": "z", "type": "generate_array", "position": {"x": 10.0, "y": 20.0},
                 "params": {"size": 100}, "color": "#ff8800"},
                {"id": "a", "type": "bubble_pass", "muted": true, "parent_id": "z"}
            ],
            "edges": [
                {"id": "e2", "source": "z", "source_port": "array",
                 "target": "a", "target_port": "array", "label": "data"},
                {"id": "e1", "source": "a", "source_port": "array",
                 "target": "z", "target_port": "array", "is_back_edge": true}
            ],
            "canvas_zoom": 0.75
        });

        let wf: Workflow = serde_json::from_value(raw.clone()).unwrap();
        let round_tripped = serde_json::to_value(&wf).unwrap();

        // Node and edge order is preserved
        assert_eq!(round_tripped["nodes"][0]["id"], "z");
        assert_eq!(round_tripped["nodes"][1]["id"], "a");
        assert_eq!(round_tripped["edges"][0]["id"], "e2");
        assert_eq!(round_tripped["edges"][1]["id"], "e1");

        // Known fields survive
        assert_eq!(round_tripped["nodes"][0]["params"]["size"], 100);
        assert_eq!(round_tripped["nodes"][1]["muted"], true);
        assert_eq!(round_tripped["edges"][1]["is_back_edge"], true);

        // Unknown fields survive at every level
        assert_eq!(round_tripped["canvas_zoom"], 0.75);
        assert_eq!(round_tripped["nodes"][0]["color"], "#ff8800");
        assert_eq!(round_tripped["edges"][0]["label"], "data");
    }

    #[test]
    fn test_defaults_on_decode() {
        let wf: Workflow = serde_json::from_value(json!({
            "nodes": [{"id": "n", "type": "gen"}],
            "edges": []
        }))
        .unwrap();

        assert_eq!(wf.name, "workflow");
        assert!(!wf.nodes[0].muted);
        assert!(wf.nodes[0].parent_id.is_none());
        assert!(wf.nodes[0].params.is_empty());
    }
}
