//! DAG execution
//!
//! The executor schedules top-level nodes in topological order over the
//! non-back-edge subgraph, routes edge values from outputs to inputs
//! (stacking multi-fan-in ports), applies muted / unavailable /
//! breakpoint semantics and streams events through an `EventSink`.
//!
//! A single execution is single-threaded and cooperative: exactly one
//! node is active at any instant, and control leaves the executor only at
//! event emission, breakpoint waits and the per-node cancellation
//! checkpoint. The registry snapshot taken at start is immutable, so
//! registry mutations during a run cannot perturb it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use patchflow_core::events::{
    ChannelEventSink, EventSink, ExecutionEvent, LogLevel, NodeErrorKind, NodeStatus,
    UnavailableReason,
};
use patchflow_core::value::{self, PortValues};
use patchflow_core::workflow::{NodeId, Workflow, WorkflowEdge, WorkflowNode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::registry::{is_loop_type, RegistrySnapshot, LOOP_GROUP, LOOP_NODE, LOOP_START};

/// Hard ceiling on loop iteration counts
pub const MAX_ITERATIONS: u64 = 10_000;

/// Clamp a requested iteration count to `1..=MAX_ITERATIONS`
pub(crate) fn clamp_iterations(raw: f64) -> u64 {
    if !raw.is_finite() || raw < 1.0 {
        return 1;
    }
    (raw as u64).min(MAX_ITERATIONS)
}

/// Knobs for one execution
pub struct ExecutionOptions {
    /// Node ids to pause at before invoking the node
    pub breakpoints: HashSet<NodeId>,
    /// Level-triggered stop signal, polled at node boundaries
    pub cancellation: CancellationToken,
    /// Deadline after which the cancellation signal fires
    pub timeout: Option<Duration>,
    /// Resume channel for breakpoints; without one, a breakpoint blocks
    /// until cancellation
    pub resume: Option<std::sync::mpsc::Receiver<NodeId>>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            breakpoints: HashSet::new(),
            cancellation: CancellationToken::new(),
            timeout: None,
            resume: None,
        }
    }
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every scheduled node ran
    Completed,
    /// A node errored; scheduling stopped there
    Failed { node_id: NodeId },
    /// The cancellation signal fired
    Cancelled,
}

/// Final results of an execution. Outputs of nodes that completed before
/// an error or cancellation remain queryable.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub outputs: HashMap<NodeId, PortValues>,
    /// Per-node lifecycle state; nodes still pending when a failure
    /// halted scheduling are marked blocked
    pub statuses: HashMap<NodeId, NodeStatus>,
    pub status: ExecutionStatus,
}

impl ExecutionOutcome {
    pub fn outputs_of(&self, node_id: &str) -> Option<&PortValues> {
        self.outputs.get(node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).copied()
    }
}

/// Why node scheduling stopped early
pub(crate) enum Halt {
    Failed(NodeId),
    Cancelled,
}

/// Executes one workflow against one registry snapshot
pub struct WorkflowExecutor {
    pub(crate) workflow: Workflow,
    pub(crate) snapshot: RegistrySnapshot,
    pub(crate) options: ExecutionOptions,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) node_outputs: HashMap<NodeId, PortValues>,
    pub(crate) statuses: HashMap<NodeId, NodeStatus>,
    /// (node id, node type, duration ms), in completion order
    pub(crate) timings: Vec<(NodeId, String, f64)>,
    deadline: Option<Instant>,
}

impl WorkflowExecutor {
    pub fn new(
        workflow: Workflow,
        snapshot: RegistrySnapshot,
        sink: Arc<dyn EventSink>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            workflow,
            snapshot,
            options,
            sink,
            node_outputs: HashMap::new(),
            statuses: HashMap::new(),
            timings: Vec::new(),
            deadline: None,
        }
    }

    /// Run the executor on a dedicated thread, streaming events through a
    /// bounded channel. The executor blocks at emission points when the
    /// consumer falls behind.
    pub fn spawn(
        workflow: Workflow,
        snapshot: RegistrySnapshot,
        options: ExecutionOptions,
        capacity: usize,
    ) -> (
        tokio::sync::mpsc::Receiver<ExecutionEvent>,
        std::thread::JoinHandle<ExecutionOutcome>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let sink = Arc::new(ChannelEventSink::new(tx));
        let handle = std::thread::Builder::new()
            .name("patchflow-executor".to_string())
            .spawn(move || Self::new(workflow, snapshot, sink, options).execute())
            .expect("executor thread spawn");
        (rx, handle)
    }

    /// Execute the workflow to completion, error or cancellation
    pub fn execute(mut self) -> ExecutionOutcome {
        self.deadline = self.options.timeout.map(|t| Instant::now() + t);

        let top_ids: Vec<NodeId> = self.workflow.top_level_nodes().map(|n| n.id.clone()).collect();
        let order = topological_sort(&top_ids, &self.workflow.edges);

        for node in &self.workflow.nodes {
            self.statuses.insert(node.id.clone(), NodeStatus::Pending);
        }

        self.emit(ExecutionEvent::Start {
            total_nodes: order.len().max(top_ids.len()),
            timestamp: ExecutionEvent::now(),
        });

        // A cyclic top-level graph is a validator-missed case; fail
        // before any node starts.
        if order.len() < top_ids.len() {
            let offender = top_ids
                .iter()
                .find(|id| !order.contains(id))
                .cloned()
                .unwrap_or_default();
            self.emit_node_error(
                &offender,
                NodeErrorKind::Runtime,
                None,
                "workflow graph is cyclic; mark loop feedback edges as back-edges".to_string(),
                String::new(),
            );
            return self.outcome(ExecutionStatus::Failed { node_id: offender });
        }

        let run_started = Instant::now();
        let mut already_executed: HashSet<NodeId> = HashSet::new();

        for node_id in &order {
            if self.cancelled() {
                self.emit(ExecutionEvent::Cancelled {
                    timestamp: ExecutionEvent::now(),
                });
                return self.outcome(ExecutionStatus::Cancelled);
            }
            if already_executed.contains(node_id) || self.node_outputs.contains_key(node_id) {
                continue;
            }

            let node = self
                .workflow
                .find_node(node_id)
                .cloned()
                .expect("scheduled node exists");
            let inputs = self.gather_inputs(node_id, &self.workflow.edges);

            let result = if node.muted {
                self.run_node(&node, inputs, None)
            } else {
                match node.node_type.as_str() {
                    LOOP_GROUP => {
                        self.set_status(&node.id, NodeStatus::Running);
                        self.emit_start(&node, None);
                        self.run_loop_group(&node, inputs)
                    }
                    LOOP_START => {
                        self.set_status(&node.id, NodeStatus::Running);
                        self.emit_start(&node, None);
                        self.run_paired_loop(&node, inputs)
                            .map(|body| already_executed.extend(body))
                    }
                    LOOP_NODE => {
                        self.set_status(&node.id, NodeStatus::Running);
                        self.emit_start(&node, None);
                        self.run_back_edge_loop(&node, inputs)
                            .map(|chain| already_executed.extend(chain))
                    }
                    _ => self.run_node(&node, inputs, None),
                }
            };

            match result {
                Ok(()) => {}
                Err(Halt::Failed(node_id)) => {
                    return self.outcome(ExecutionStatus::Failed { node_id })
                }
                Err(Halt::Cancelled) => {
                    self.emit(ExecutionEvent::Cancelled {
                        timestamp: ExecutionEvent::now(),
                    });
                    return self.outcome(ExecutionStatus::Cancelled);
                }
            }
        }

        let total_ms = run_started.elapsed().as_secs_f64() * 1000.0;
        self.emit_profiler_summary(total_ms);
        self.emit(ExecutionEvent::Complete {
            total_ms,
            timestamp: ExecutionEvent::now(),
        });
        self.outcome(ExecutionStatus::Completed)
    }

    fn outcome(mut self, status: ExecutionStatus) -> ExecutionOutcome {
        if matches!(status, ExecutionStatus::Failed { .. }) {
            for state in self.statuses.values_mut() {
                if *state == NodeStatus::Pending {
                    *state = NodeStatus::Blocked;
                }
            }
        }
        ExecutionOutcome {
            outputs: self.node_outputs,
            statuses: self.statuses,
            status,
        }
    }

    pub(crate) fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        self.statuses.insert(node_id.to_string(), status);
    }

    /// Execute one non-construct node: muted pass-through, availability
    /// check, breakpoint wait, then invocation with timing and events.
    pub(crate) fn run_node(
        &mut self,
        node: &WorkflowNode,
        inputs: PortValues,
        loop_index: Option<u64>,
    ) -> Result<(), Halt> {
        if self.cancelled() {
            return Err(Halt::Cancelled);
        }
        let started = Instant::now();
        self.set_status(&node.id, NodeStatus::Running);
        self.emit_start(node, loop_index);

        if node.muted {
            let outputs = self.mute_outputs(node, &inputs);
            self.node_outputs.insert(node.id.clone(), outputs.clone());
            let duration_ms = elapsed_ms(started);
            self.set_status(&node.id, NodeStatus::Skipped);
            self.record_timing(&node.id, &node.node_type, duration_ms);
            self.emit_log(&node.id, LogLevel::Info, "Muted - passing inputs through");
            self.emit_complete(&node.id, &outputs, duration_ms, loop_index);
            return Ok(());
        }

        if self.snapshot.spec(&node.node_type).is_none() {
            let (reason, error) = match self.snapshot.inactive_owner(&node.node_type) {
                Some(owner) => (
                    UnavailableReason::Inactive,
                    format!(
                        "Node type '{}' belongs to inactive plugin '{owner}' - activate it to run this workflow",
                        node.node_type
                    ),
                ),
                None => (
                    UnavailableReason::Unknown,
                    format!(
                        "Unknown node type '{}' - the providing plugin is not installed",
                        node.node_type
                    ),
                ),
            };
            self.set_status(&node.id, NodeStatus::Errored);
            self.emit_node_error(
                &node.id,
                NodeErrorKind::Unavailable,
                Some(reason),
                error,
                String::new(),
            );
            return Err(Halt::Failed(node.id.clone()));
        }

        let Some(executor) = self.snapshot.executor(&node.node_type).cloned() else {
            self.set_status(&node.id, NodeStatus::Errored);
            self.emit_node_error(
                &node.id,
                NodeErrorKind::Runtime,
                None,
                format!("Node type '{}' has no executor", node.node_type),
                String::new(),
            );
            return Err(Halt::Failed(node.id.clone()));
        };

        if self.options.breakpoints.contains(&node.id) {
            self.set_status(&node.id, NodeStatus::Breakpoint);
            self.emit(ExecutionEvent::NodeBreakpoint {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                inputs: value::summarize_map(&inputs),
                timestamp: ExecutionEvent::now(),
            });
            self.wait_at_breakpoint(&node.id)?;
            self.set_status(&node.id, NodeStatus::Running);
        }

        let mut logs = Vec::new();
        let result = executor.execute(&node.params, &inputs, &mut logs);
        let duration_ms = elapsed_ms(started);
        for line in logs {
            self.emit(ExecutionEvent::Log {
                node_id: Some(node.id.clone()),
                level: line.level,
                message: line.message,
                timestamp: ExecutionEvent::now(),
            });
        }

        match result {
            Ok(outputs) => {
                self.node_outputs.insert(node.id.clone(), outputs.clone());
                self.set_status(&node.id, NodeStatus::Completed);
                self.record_timing(&node.id, &node.node_type, duration_ms);
                self.emit_complete(&node.id, &outputs, duration_ms, loop_index);
                Ok(())
            }
            Err(e) => {
                self.set_status(&node.id, NodeStatus::Errored);
                self.record_timing(&node.id, &node.node_type, duration_ms);
                self.emit_node_error(
                    &node.id,
                    NodeErrorKind::Runtime,
                    None,
                    e.message,
                    e.stack_trace,
                );
                Err(Halt::Failed(node.id.clone()))
            }
        }
    }

    /// Collect inputs for a node from upstream outputs over the given
    /// edge set. Multiple edges into one port stack into an array in edge
    /// insertion order; a single edge delivers the value unwrapped.
    pub(crate) fn gather_inputs(&self, node_id: &str, edges: &[WorkflowEdge]) -> PortValues {
        let mut stacks: Vec<(String, Vec<Value>)> = Vec::new();
        for edge in edges {
            if edge.is_back_edge || edge.target != node_id {
                continue;
            }
            let Some(source_outputs) = self.node_outputs.get(&edge.source) else {
                continue;
            };
            let Some(value) = source_outputs.get(&edge.source_port) else {
                continue;
            };
            match stacks.iter_mut().find(|(port, _)| *port == edge.target_port) {
                Some((_, values)) => values.push(value.clone()),
                None => stacks.push((edge.target_port.clone(), vec![value.clone()])),
            }
        }

        let mut inputs = PortValues::new();
        for (port, mut values) in stacks {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            inputs.insert(port, value);
        }
        inputs
    }

    /// Pass-through outputs for a muted node: ports present in both the
    /// spec's inputs and outputs receive the input's value. With no spec
    /// to intersect (unknown types, loop constructs), every input passes
    /// through.
    fn mute_outputs(&self, node: &WorkflowNode, inputs: &PortValues) -> PortValues {
        let spec = (!is_loop_type(&node.node_type))
            .then(|| self.snapshot.spec(&node.node_type))
            .flatten();
        match spec {
            Some(spec) => {
                let mut outputs = PortValues::new();
                for port in &spec.outputs {
                    if spec.input(&port.name).is_some() {
                        if let Some(v) = inputs.get(&port.name) {
                            outputs.insert(port.name.clone(), v.clone());
                        }
                    }
                }
                outputs
            }
            None => inputs.clone(),
        }
    }

    /// Resolve a loop construct's iteration count: a connected
    /// `iterations` input overrides params, which override the default
    /// of 10. The result is clamped.
    pub(crate) fn iteration_count(&self, node: &WorkflowNode, inputs: &PortValues) -> u64 {
        let raw = inputs
            .get("iterations")
            .or_else(|| node.params.get("iterations"))
            .and_then(Value::as_f64)
            .unwrap_or(10.0);
        clamp_iterations(raw)
    }

    /// Block at a breakpoint until a resume signal for this node or
    /// cancellation. Without a resume channel this waits for
    /// cancellation alone.
    fn wait_at_breakpoint(&mut self, node_id: &str) -> Result<(), Halt> {
        loop {
            if self.cancelled() {
                return Err(Halt::Cancelled);
            }
            if let Some(rx) = &self.options.resume {
                loop {
                    match rx.try_recv() {
                        Ok(resumed) if resumed == node_id => return Ok(()),
                        Ok(_) => continue,
                        Err(std::sync::mpsc::TryRecvError::Empty) => break,
                        Err(std::sync::mpsc::TryRecvError::Disconnected) => break,
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// One-way cancellation check; a passed deadline latches the token
    pub(crate) fn cancelled(&mut self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.options.cancellation.cancel();
            }
        }
        self.options.cancellation.is_cancelled()
    }

    pub(crate) fn record_timing(&mut self, node_id: &str, node_type: &str, duration_ms: f64) {
        self.timings
            .push((node_id.to_string(), node_type.to_string(), duration_ms));
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        if let Err(e) = self.sink.send(event) {
            log::warn!("event sink rejected event: {e}");
        }
    }

    pub(crate) fn emit_start(&self, node: &WorkflowNode, loop_index: Option<u64>) {
        self.emit(ExecutionEvent::NodeStart {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            loop_index,
            timestamp: ExecutionEvent::now(),
        });
    }

    pub(crate) fn emit_complete(
        &self,
        node_id: &str,
        outputs: &PortValues,
        duration_ms: f64,
        loop_index: Option<u64>,
    ) {
        self.emit(ExecutionEvent::NodeComplete {
            node_id: node_id.to_string(),
            outputs: value::summarize_map(outputs),
            duration_ms,
            loop_index,
            timestamp: ExecutionEvent::now(),
        });
    }

    pub(crate) fn emit_node_error(
        &self,
        node_id: &str,
        kind: NodeErrorKind,
        reason: Option<UnavailableReason>,
        error: String,
        stack_trace: String,
    ) {
        self.emit(ExecutionEvent::NodeError {
            node_id: node_id.to_string(),
            error,
            stack_trace,
            kind,
            reason,
            timestamp: ExecutionEvent::now(),
        });
    }

    pub(crate) fn emit_log(&self, node_id: &str, level: LogLevel, message: impl Into<String>) {
        self.emit(ExecutionEvent::Log {
            node_id: Some(node_id.to_string()),
            level,
            message: message.into(),
            timestamp: ExecutionEvent::now(),
        });
    }

    fn emit_profiler_summary(&self, total_ms: f64) {
        let mut node_timings = PortValues::new();
        for (node_id, node_type, duration_ms) in &self.timings {
            node_timings.insert(
                node_id.clone(),
                json!({
                    "node_type": node_type,
                    "duration_ms": (duration_ms * 100.0).round() / 100.0,
                }),
            );
        }
        let slowest_node = self
            .timings
            .iter()
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(id, _, _)| id.clone());
        self.emit(ExecutionEvent::ProfilerSummary {
            total_ms: (total_ms * 100.0).round() / 100.0,
            node_timings,
            slowest_node,
            timestamp: ExecutionEvent::now(),
        });
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Kahn's algorithm over the given node ids, skipping back-edges and
/// edges leaving the id set. Seeded in `ids` order, so scheduling is
/// deterministic. Nodes on a cycle are absent from the result.
pub(crate) fn topological_sort(ids: &[NodeId], edges: &[WorkflowEdge]) -> Vec<NodeId> {
    let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in edges {
        if edge.is_back_edge {
            continue;
        }
        if id_set.contains(edge.source.as_str()) && id_set.contains(edge.target.as_str()) {
            *in_degree.get_mut(edge.target.as_str()).expect("target in set") += 1;
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    let mut queue: VecDeque<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(ids.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for &next in adjacency.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(next).expect("adjacent in set");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(next);
            }
        }
    }
    order
}
