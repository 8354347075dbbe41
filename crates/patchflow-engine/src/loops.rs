//! The three loop constructs
//!
//! Each construct identifies its iterated subgraph differently and feeds
//! values back differently:
//!
//! - **Container loop** (`loop_group`): owns children via `parent_id`;
//!   state slots live on the group's ports and are updated by edges that
//!   exit a child back into the group.
//! - **Paired loop** (`loop_start` + `loop_end`): the body is everything
//!   reachable from the start without passing the end; values arriving at
//!   the end's `in_*` ports feed the start's same-indexed `out_*` ports on
//!   the next iteration.
//! - **Back-edge loop** (`loop_node`): a single node whose `loop_*`
//!   outputs drive a downstream chain; `is_back_edge` edges into its
//!   `feedback_*` ports carry the next iteration's values, and `done_*`
//!   publishes the final ones.
//!
//! For every construct the iteration count comes from a connected
//! `iterations` input, then `params`, then the default of 10, clamped.
//! Child/body node events carry a `loop_index` so clients can tell
//! iterations apart; the construct itself gets one `node_start` /
//! `node_complete` pair around the whole run.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use patchflow_core::events::{LogLevel, NodeStatus};
use patchflow_core::value::PortValues;
use patchflow_core::workflow::{NodeId, WorkflowEdge, WorkflowNode};

use crate::executor::{elapsed_ms, topological_sort, Halt, WorkflowExecutor};
use crate::registry::LOOP_END;

impl WorkflowExecutor {
    /// Container loop: run the `parent_id` children N times, with the
    /// group's outputs acting as source values for each iteration.
    pub(crate) fn run_loop_group(
        &mut self,
        node: &WorkflowNode,
        inputs: PortValues,
    ) -> Result<(), Halt> {
        let started = Instant::now();
        let iterations = self.iteration_count(node, &inputs);

        // Initial state: connected inputs, then params for unfed slots
        let mut state = inputs;
        state.remove("iterations");
        for (key, value) in &node.params {
            if key != "iterations" && !state.contains_key(key) {
                state.insert(key.clone(), value.clone());
            }
        }

        let children: Vec<WorkflowNode> = self.workflow.children_of(&node.id).cloned().collect();
        if children.is_empty() {
            log::debug!("loop group {} has no children, passing through", node.id);
            self.node_outputs.insert(node.id.clone(), state.clone());
            let duration_ms = elapsed_ms(started);
            self.set_status(&node.id, NodeStatus::Completed);
            self.record_timing(&node.id, &node.node_type, duration_ms);
            self.emit_complete(&node.id, &state, duration_ms, None);
            return Ok(());
        }

        let child_ids: Vec<NodeId> = children.iter().map(|c| c.id.clone()).collect();
        let child_id_set: HashSet<&str> = child_ids.iter().map(String::as_str).collect();

        // Edges inside the construct: child-to-child, entry (group to
        // child) and exit (child back into the group)
        let internal_edges: Vec<WorkflowEdge> = self
            .workflow
            .edges
            .iter()
            .filter(|e| {
                let source_in = child_id_set.contains(e.source.as_str()) || e.source == node.id;
                let target_in = child_id_set.contains(e.target.as_str()) || e.target == node.id;
                source_in && target_in
            })
            .cloned()
            .collect();

        let exit_edges: Vec<WorkflowEdge> = internal_edges
            .iter()
            .filter(|e| {
                !e.is_back_edge && child_id_set.contains(e.source.as_str()) && e.target == node.id
            })
            .cloned()
            .collect();

        let order = topological_sort(&child_ids, &internal_edges);

        for i in 0..iterations {
            self.emit_iteration_log(&node.id, i, iterations);

            // The group's outputs are this iteration's source values
            self.node_outputs.insert(node.id.clone(), state.clone());

            for child_id in &order {
                let child = children
                    .iter()
                    .find(|c| &c.id == child_id)
                    .expect("ordered child exists")
                    .clone();
                let child_inputs = self.gather_inputs(child_id, &internal_edges);
                self.run_node(&child, child_inputs, Some(i))?;
            }

            // Exit edges update the state slots for the next iteration
            for edge in &exit_edges {
                if let Some(value) = self
                    .node_outputs
                    .get(&edge.source)
                    .and_then(|outputs| outputs.get(&edge.source_port))
                {
                    state.insert(edge.target_port.clone(), value.clone());
                }
            }
        }

        self.node_outputs.insert(node.id.clone(), state.clone());
        let duration_ms = elapsed_ms(started);
        self.set_status(&node.id, NodeStatus::Completed);
        self.record_timing(&node.id, &node.node_type, duration_ms);
        self.emit_complete(&node.id, &state, duration_ms, None);
        Ok(())
    }

    /// Paired loop: run the start..end body N times, feeding the end's
    /// outputs back into the start. Returns the body node ids so the
    /// scheduler skips them.
    pub(crate) fn run_paired_loop(
        &mut self,
        start: &WorkflowNode,
        inputs: PortValues,
    ) -> Result<HashSet<NodeId>, Halt> {
        let started = Instant::now();

        let Some(end) = self
            .workflow
            .nodes
            .iter()
            .find(|n| {
                n.node_type == LOOP_END
                    && n.params.get("pair_id").and_then(|v| v.as_str()) == Some(start.id.as_str())
            })
            .cloned()
        else {
            self.set_status(&start.id, NodeStatus::Errored);
            self.emit_node_error(
                &start.id,
                patchflow_core::events::NodeErrorKind::Runtime,
                None,
                format!(
                    "Loop start '{}' has no paired loop end (set pair_id on a loop end)",
                    start.id
                ),
                String::new(),
            );
            return Err(Halt::Failed(start.id.clone()));
        };

        let iterations = self.iteration_count(start, &inputs);

        // Body: forward-reachable from the start, not traversing past
        // the end (the end itself is included)
        let forward: Vec<WorkflowEdge> = self
            .workflow
            .edges
            .iter()
            .filter(|e| !e.is_back_edge)
            .cloned()
            .collect();
        let mut body: HashSet<NodeId> = HashSet::new();
        let mut queue = vec![start.id.clone()];
        while let Some(id) = queue.pop() {
            if !body.insert(id.clone()) {
                continue;
            }
            if id == end.id {
                continue;
            }
            for edge in &forward {
                if edge.source == id && !body.contains(&edge.target) {
                    queue.push(edge.target.clone());
                }
            }
        }

        let body_ids: Vec<NodeId> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| body.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let body_nodes: HashMap<NodeId, WorkflowNode> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| body.contains(&n.id))
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        let body_edges: Vec<WorkflowEdge> = forward
            .iter()
            .filter(|e| body.contains(&e.source) && body.contains(&e.target))
            .cloned()
            .collect();
        let order = topological_sort(&body_ids, &body_edges);

        // State: the start's in_N slots, seeded from upstream
        let mut current = PortValues::new();
        for (key, value) in &inputs {
            if key.starts_with("in_") {
                current.insert(key.clone(), value.clone());
            }
        }

        for i in 0..iterations {
            self.emit_iteration_log(&start.id, i, iterations);

            // in_N -> out_N: the start republishes the current state
            let mut start_outputs = PortValues::new();
            for (key, value) in &current {
                start_outputs.insert(key.replacen("in_", "out_", 1), value.clone());
            }
            self.node_outputs.insert(start.id.clone(), start_outputs);

            for body_id in &order {
                if body_id == &start.id {
                    continue;
                }
                let node = body_nodes[body_id].clone();
                let node_inputs = self.gather_inputs(body_id, &body_edges);
                if body_id == &end.id {
                    self.run_loop_end(&node, node_inputs, i)?;
                } else {
                    self.run_node(&node, node_inputs, Some(i))?;
                }
            }

            // Feedback: the end's out_N values become next iteration's in_N
            if let Some(end_outputs) = self.node_outputs.get(&end.id).cloned() {
                for (key, value) in end_outputs {
                    let in_key = key.replacen("out_", "in_", 1);
                    if current.contains_key(&in_key) || !value.is_null() {
                        current.insert(in_key, value);
                    }
                }
            }
        }

        let duration_ms = elapsed_ms(started);
        self.set_status(&start.id, NodeStatus::Completed);
        self.record_timing(&start.id, &start.node_type, duration_ms);
        let final_outputs = self.node_outputs.get(&start.id).cloned().unwrap_or_default();
        self.emit_complete(&start.id, &final_outputs, duration_ms, None);
        Ok(body)
    }

    /// The loop end is a construct, not a plugin: it republishes its
    /// `in_*` inputs on the matching `out_*` ports.
    fn run_loop_end(
        &mut self,
        node: &WorkflowNode,
        inputs: PortValues,
        loop_index: u64,
    ) -> Result<(), Halt> {
        if self.cancelled() {
            return Err(Halt::Cancelled);
        }
        let started = Instant::now();
        self.emit_start(node, Some(loop_index));

        let mut outputs = PortValues::new();
        for (key, value) in &inputs {
            if let Some(slot) = key.strip_prefix("in_") {
                outputs.insert(format!("out_{slot}"), value.clone());
            }
        }
        self.node_outputs.insert(node.id.clone(), outputs.clone());

        let duration_ms = elapsed_ms(started);
        self.set_status(&node.id, NodeStatus::Completed);
        self.record_timing(&node.id, &node.node_type, duration_ms);
        self.emit_complete(&node.id, &outputs, duration_ms, Some(loop_index));
        Ok(())
    }

    /// Back-edge loop: the chain downstream of the `loop_*` outputs runs
    /// N times; back-edges into `feedback_*` carry the next iteration's
    /// slot values. After the final iteration only the `done_*` bank is
    /// published. Returns the chain node ids so the scheduler skips them.
    pub(crate) fn run_back_edge_loop(
        &mut self,
        node: &WorkflowNode,
        inputs: PortValues,
    ) -> Result<HashSet<NodeId>, Halt> {
        let started = Instant::now();
        let iterations = self.iteration_count(node, &inputs);

        let forward: Vec<WorkflowEdge> = self
            .workflow
            .edges
            .iter()
            .filter(|e| !e.is_back_edge)
            .cloned()
            .collect();
        let back_edges: Vec<WorkflowEdge> = self
            .workflow
            .edges
            .iter()
            .filter(|e| e.is_back_edge)
            .cloned()
            .collect();

        // The chain: forward-reachable from the loop_* outputs
        let mut chain: HashSet<NodeId> = HashSet::new();
        let mut queue: Vec<NodeId> = forward
            .iter()
            .filter(|e| e.source == node.id && e.source_port.starts_with("loop_"))
            .map(|e| e.target.clone())
            .collect();
        while let Some(id) = queue.pop() {
            if id == node.id || !chain.insert(id.clone()) {
                continue;
            }
            for edge in &forward {
                if edge.source == id && edge.target != node.id {
                    queue.push(edge.target.clone());
                }
            }
        }

        let chain_ids: Vec<NodeId> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| chain.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let chain_nodes: HashMap<NodeId, WorkflowNode> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| chain.contains(&n.id))
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        // Chain gathering needs chain-to-chain edges plus the loop
        // node's own outgoing edges
        let chain_edges: Vec<WorkflowEdge> = forward
            .iter()
            .filter(|e| {
                (chain.contains(&e.source) || e.source == node.id) && chain.contains(&e.target)
            })
            .cloned()
            .collect();
        let order = topological_sort(&chain_ids, &chain_edges);

        // Slots: init_N inputs keyed by their suffix
        let mut slots = PortValues::new();
        for (key, value) in &inputs {
            if let Some(slot) = key.strip_prefix("init_") {
                slots.insert(slot.to_string(), value.clone());
            }
        }

        for i in 0..iterations {
            self.emit_iteration_log(&node.id, i, iterations);

            let mut loop_outputs = PortValues::new();
            for (slot, value) in &slots {
                loop_outputs.insert(format!("loop_{slot}"), value.clone());
                loop_outputs.insert(format!("done_{slot}"), value.clone());
            }
            self.node_outputs.insert(node.id.clone(), loop_outputs);

            for chain_id in &order {
                let chain_node = chain_nodes[chain_id].clone();
                let node_inputs = self.gather_inputs(chain_id, &chain_edges);
                self.run_node(&chain_node, node_inputs, Some(i))?;
            }

            for edge in &back_edges {
                if edge.target != node.id {
                    continue;
                }
                let Some(slot) = edge.target_port.strip_prefix("feedback_") else {
                    continue;
                };
                if let Some(value) = self
                    .node_outputs
                    .get(&edge.source)
                    .and_then(|outputs| outputs.get(&edge.source_port))
                {
                    slots.insert(slot.to_string(), value.clone());
                }
            }
        }

        // Final publication: the loop_* bank ceases producing
        let mut done_outputs = PortValues::new();
        for (slot, value) in &slots {
            done_outputs.insert(format!("done_{slot}"), value.clone());
        }
        self.node_outputs.insert(node.id.clone(), done_outputs.clone());

        let duration_ms = elapsed_ms(started);
        self.set_status(&node.id, NodeStatus::Completed);
        self.record_timing(&node.id, &node.node_type, duration_ms);
        self.emit_complete(&node.id, &done_outputs, duration_ms, None);
        Ok(chain)
    }

    /// Progress line at the first iteration and every tenth one
    fn emit_iteration_log(&self, node_id: &str, index: u64, total: u64) {
        if index == 0 || (index + 1) % 10 == 0 {
            self.emit_log(
                node_id,
                LogLevel::Info,
                format!("Iteration {}/{}", index + 1, total),
            );
        }
    }
}
