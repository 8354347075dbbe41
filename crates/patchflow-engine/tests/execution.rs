//! End-to-end execution: script plugins driving the scheduler, the loop
//! constructs, validation-before-execution and the streamed event feed.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use patchflow_core::events::{ExecutionEvent, VecEventSink};
use patchflow_core::workflow::{Workflow, WorkflowEdge, WorkflowNode};
use patchflow_engine::executor::{ExecutionOptions, ExecutionStatus, WorkflowExecutor};
use patchflow_engine::registry::PluginRegistry;
use patchflow_engine::validator::{validate_workflow, IssueLevel};
use serde_json::json;

const GEN: &str = r#"
const NODE_INFO = {
    type: "gen",
    label: "Gen",
    category: "SOURCE",
    ports_in: [{name: "n", type: "NUMBER", default: 3}],
    ports_out: [{name: "out", type: "ARRAY"}],
};
function run(n) {
    const out = [];
    for (let i = 1; i <= n; i++) out.push(i);
    return out;
}
"#;

const DOUBLE: &str = r#"
const NODE_INFO = {
    type: "double",
    label: "Double",
    category: "MAP",
    ports_in: [{name: "in", type: "ARRAY"}],
    ports_out: [{name: "out", type: "ARRAY"}],
};
function run(xs) { return xs.map((x) => x * 2); }
"#;

const DOUBLE_NUM: &str = r#"
const NODE_INFO = {
    type: "double_num",
    label: "Double Number",
    category: "MAP",
    ports_in: [{name: "x", type: "NUMBER"}],
    ports_out: [{name: "x", type: "NUMBER"}],
};
function run(x) { return x * 2; }
"#;

const INCREMENT: &str = r#"
const NODE_INFO = {
    type: "increment",
    label: "Increment",
    category: "MAP",
    ports_in: [{name: "x", type: "NUMBER"}],
    ports_out: [{name: "y", type: "NUMBER"}],
};
function run(x) { return x + 1; }
"#;

const CONSTANT: &str = r#"
const NODE_INFO = {
    type: "constant",
    label: "Constant",
    category: "SOURCE",
    ports_in: [{name: "value", type: "NUMBER", default: 0}],
    ports_out: [{name: "value", type: "NUMBER"}],
};
function run(value) { return value; }
"#;

fn plugin_tree(root: &Path) -> PluginRegistry {
    let nodes = root.join("demo").join("nodes");
    fs::create_dir_all(&nodes).unwrap();
    fs::write(
        root.join("demo").join("manifest.json"),
        json!({"name": "demo", "version": "0.1.0"}).to_string(),
    )
    .unwrap();
    for (name, source) in [
        ("gen", GEN),
        ("double", DOUBLE),
        ("double_num", DOUBLE_NUM),
        ("increment", INCREMENT),
        ("constant", CONSTANT),
    ] {
        fs::write(nodes.join(format!("{name}.js")), source).unwrap();
    }
    let registry = PluginRegistry::new(root);
    registry.reload();
    registry
}

fn execute(
    workflow: Workflow,
    registry: &PluginRegistry,
) -> (
    patchflow_engine::executor::ExecutionOutcome,
    Vec<ExecutionEvent>,
) {
    let sink = Arc::new(VecEventSink::new());
    let outcome = WorkflowExecutor::new(
        workflow,
        registry.snapshot(),
        sink.clone(),
        ExecutionOptions::default(),
    )
    .execute();
    (outcome, sink.events())
}

#[test]
fn linear_pipeline_events_and_results() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    let wf = Workflow::new("linear")
        .add_node(WorkflowNode::new("A", "gen").with_param("n", 3))
        .add_node(WorkflowNode::new("B", "double"))
        .add_edge(WorkflowEdge::new("e1", "A", "out", "B", "in"));

    let (outcome, events) = execute(wf, &registry);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.outputs_of("A").unwrap()["out"], json!([1, 2, 3]));
    assert_eq!(outcome.outputs_of("B").unwrap()["out"], json!([2, 4, 6]));

    let names: Vec<&str> = events
        .iter()
        .map(|e| match e {
            ExecutionEvent::Start { .. } => "start",
            ExecutionEvent::NodeStart { .. } => "node_start",
            ExecutionEvent::NodeComplete { .. } => "node_complete",
            ExecutionEvent::ProfilerSummary { .. } => "profiler_summary",
            ExecutionEvent::Complete { .. } => "complete",
            _ => "other",
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "start",
            "node_start",
            "node_complete",
            "node_start",
            "node_complete",
            "profiler_summary",
            "complete"
        ]
    );
}

#[test]
fn container_loop_with_script_child() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    let wf = Workflow::new("container")
        .add_node(WorkflowNode::new("seed", "constant").with_param("value", 1))
        .add_node(WorkflowNode::new("L", "loop_group").with_param("iterations", 3))
        .add_node(WorkflowNode::new("C", "double_num").with_parent("L"))
        .add_edge(WorkflowEdge::new("e1", "seed", "value", "L", "x"))
        .add_edge(WorkflowEdge::new("e2", "L", "x", "C", "x"))
        .add_edge(WorkflowEdge::new("e3", "C", "x", "L", "x"));

    let (outcome, events) = execute(wf, &registry);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.outputs_of("L").unwrap()["x"], json!(8));

    let indices: Vec<Option<u64>> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::NodeStart {
                node_id,
                loop_index,
                ..
            } if node_id == "C" => Some(*loop_index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
}

#[test]
fn paired_loop_with_script_body() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    let wf = Workflow::new("paired")
        .add_node(WorkflowNode::new("zero", "constant").with_param("value", 0))
        .add_node(WorkflowNode::new("S", "loop_start").with_param("iterations", 4))
        .add_node(WorkflowNode::new("inc", "increment"))
        .add_node(WorkflowNode::new("E", "loop_end").with_param("pair_id", "S"))
        .add_node(WorkflowNode::new("sink", "double_num"))
        .add_edge(WorkflowEdge::new("e1", "zero", "value", "S", "in_1"))
        .add_edge(WorkflowEdge::new("e2", "S", "out_1", "inc", "x"))
        .add_edge(WorkflowEdge::new("e3", "inc", "y", "E", "in_1"))
        .add_edge(WorkflowEdge::new("e4", "E", "out_1", "sink", "x"));

    let (outcome, _) = execute(wf, &registry);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.outputs_of("E").unwrap()["out_1"], json!(4));
    // Downstream of the loop keeps flowing normally
    assert_eq!(outcome.outputs_of("sink").unwrap()["x"], json!(8));
}

#[test]
fn back_edge_loop_with_script_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    let wf = Workflow::new("feedback")
        .add_node(WorkflowNode::new("one", "constant").with_param("value", 1))
        .add_node(WorkflowNode::new("L", "loop_node").with_param("iterations", 4))
        .add_node(WorkflowNode::new("D", "double_num"))
        .add_edge(WorkflowEdge::new("e1", "one", "value", "L", "init_1"))
        .add_edge(WorkflowEdge::new("e2", "L", "loop_1", "D", "x"))
        .add_edge(WorkflowEdge::new("e3", "D", "x", "L", "feedback_1").back_edge());

    let (outcome, _) = execute(wf, &registry);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.outputs_of("L").unwrap()["done_1"], json!(16));
}

#[test]
fn validator_blesses_then_executor_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    // Cycle without back-edge flags: the validator flags it, the
    // executor refuses it
    let cyclic = Workflow::new("cycle")
        .add_node(WorkflowNode::new("A", "double"))
        .add_node(WorkflowNode::new("B", "double"))
        .add_node(WorkflowNode::new("C", "double"))
        .add_edge(WorkflowEdge::new("e1", "A", "out", "B", "in"))
        .add_edge(WorkflowEdge::new("e2", "B", "out", "C", "in"))
        .add_edge(WorkflowEdge::new("e3", "C", "out", "A", "in"));

    let issues = validate_workflow(&cyclic, &registry.snapshot());
    let cycle_errors: Vec<_> = issues
        .iter()
        .filter(|i| i.level == IssueLevel::Error && i.message.contains("cycle"))
        .collect();
    assert_eq!(cycle_errors.len(), 1);
    assert!(["A", "B", "C"].contains(&cycle_errors[0].node_id.as_deref().unwrap()));

    // Marking the closing edge as a back-edge clears the cycle error
    let mut fixed = cyclic.clone();
    fixed.edges[2].is_back_edge = true;
    let issues = validate_workflow(&fixed, &registry.snapshot());
    assert!(!issues.iter().any(|i| i.message.contains("cycle")));

    let (outcome, _) = execute(cyclic, &registry);
    assert!(matches!(outcome.status, ExecutionStatus::Failed { .. }));
}

#[test]
fn streamed_execution_over_a_bounded_channel() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    let wf = Workflow::new("streamed")
        .add_node(WorkflowNode::new("A", "gen").with_param("n", 4))
        .add_node(WorkflowNode::new("B", "double"))
        .add_edge(WorkflowEdge::new("e1", "A", "out", "B", "in"));

    // Tiny capacity: the consumer drains while the executor runs, so
    // backpressure is actually exercised
    let (mut rx, handle) =
        WorkflowExecutor::spawn(wf, registry.snapshot(), ExecutionOptions::default(), 1);

    let mut events = Vec::new();
    while let Some(event) = rx.blocking_recv() {
        events.push(event);
    }
    let outcome = handle.join().unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(matches!(events.first(), Some(ExecutionEvent::Start { .. })));
    assert!(matches!(events.last(), Some(ExecutionEvent::Complete { .. })));

    // Per-node ordering guarantee: start before complete for both nodes
    let position = |pred: &dyn Fn(&ExecutionEvent) -> bool| events.iter().position(|e| pred(e));
    let a_start = position(&|e| {
        matches!(e, ExecutionEvent::NodeStart { node_id, .. } if node_id == "A")
    })
    .unwrap();
    let a_complete = position(&|e| {
        matches!(e, ExecutionEvent::NodeComplete { node_id, .. } if node_id == "A")
    })
    .unwrap();
    let b_start = position(&|e| {
        matches!(e, ExecutionEvent::NodeStart { node_id, .. } if node_id == "B")
    })
    .unwrap();
    assert!(a_start < a_complete && a_complete < b_start);
}

#[test]
fn summarized_outputs_for_large_arrays() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = plugin_tree(tmp.path());

    let wf = Workflow::new("large").add_node(WorkflowNode::new("A", "gen").with_param("n", 100));
    let (outcome, events) = execute(wf, &registry);

    // Full value in the results map
    assert_eq!(
        outcome.outputs_of("A").unwrap()["out"].as_array().unwrap().len(),
        100
    );

    // Summarized value on the event stream
    let summary = events
        .iter()
        .find_map(|e| match e {
            ExecutionEvent::NodeComplete { outputs, .. } => Some(outputs["out"].clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(summary["type"], "array");
    assert_eq!(summary["length"], 100);
    assert_eq!(summary["first_10"].as_array().unwrap().len(), 10);
}
