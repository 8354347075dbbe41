//! Event types for streaming execution progress
//!
//! Events are produced by the executor and consumed by a transport layer
//! (WebSocket broadcast, test collectors). The `EventSink` trait abstracts
//! over the transport so the engine is not tied to any of them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::value::PortValues;
use crate::workflow::NodeId;

/// Trait for delivering execution events
///
/// A sink may block the caller (the executor) to apply backpressure; the
/// executor treats every emission as a suspension point.
pub trait EventSink: Send + Sync {
    /// Deliver an event.
    ///
    /// Returns an error if the event could not be delivered (e.g. the
    /// consumer went away).
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError>;
}

/// Error when delivering events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "channel closed".to_string(),
        }
    }
}

/// Why a node type could not be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The owning plugin is present on disk but deactivated
    Inactive,
    /// No plugin declares this node type
    Unknown,
}

/// Classification carried on `node_error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// The node's executor raised during invocation
    Runtime,
    /// The node type is absent from the registry snapshot
    Unavailable,
}

/// Severity of a `log` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Per-node lifecycle state over one execution, reported with the final
/// results so the canvas can color nodes after the stream ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Scheduled but not reached yet
    Pending,
    /// Currently executing
    Running,
    /// Finished and published outputs
    Completed,
    /// Raised or was unavailable; execution halted here
    Errored,
    /// Muted; inputs passed through without invocation
    Skipped,
    /// Never ran because an upstream node errored
    Blocked,
    /// Paused at a breakpoint, waiting for a resume signal
    Breakpoint,
}

/// Events emitted during workflow execution
///
/// Every event carries a float-seconds `timestamp`. Per-node events are
/// guaranteed to arrive in the order start, logs, then complete or error;
/// events across nodes are ordered by emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Execution started
    Start { total_nodes: usize, timestamp: f64 },

    /// A node began executing
    NodeStart {
        node_id: NodeId,
        node_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_index: Option<u64>,
        timestamp: f64,
    },

    /// A node finished; `outputs` is a summarized snapshot
    NodeComplete {
        node_id: NodeId,
        outputs: PortValues,
        duration_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_index: Option<u64>,
        timestamp: f64,
    },

    /// A node failed; execution halts after this event
    NodeError {
        node_id: NodeId,
        error: String,
        stack_trace: String,
        kind: NodeErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<UnavailableReason>,
        timestamp: f64,
    },

    /// Execution paused at a breakpoint, waiting for a resume signal
    NodeBreakpoint {
        node_id: NodeId,
        node_type: String,
        inputs: PortValues,
        timestamp: f64,
    },

    /// A log line, from a plugin's injected logger or a loop driver
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        level: LogLevel,
        message: String,
        timestamp: f64,
    },

    /// Per-node wall-clock timings, emitted just before `complete`
    ProfilerSummary {
        total_ms: f64,
        node_timings: PortValues,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slowest_node: Option<NodeId>,
        timestamp: f64,
    },

    /// Execution finished; all reachable nodes ran
    Complete { total_ms: f64, timestamp: f64 },

    /// Execution halted by the cancellation signal
    Cancelled { timestamp: f64 },
}

impl ExecutionEvent {
    /// Current time as float seconds since the epoch
    pub fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// The node this event concerns, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStart { node_id, .. }
            | Self::NodeComplete { node_id, .. }
            | Self::NodeError { node_id, .. }
            | Self::NodeBreakpoint { node_id, .. } => Some(node_id),
            Self::Log { node_id, .. } => node_id.as_deref(),
            _ => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: ExecutionEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
#[derive(Default)]
pub struct VecEventSink {
    events: std::sync::Mutex<Vec<ExecutionEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Event sink backed by a bounded channel
///
/// `send` blocks when the channel is full, which is how consumer
/// backpressure reaches the executor. Intended to be called from the
/// executor's dedicated thread, never from inside an async task.
pub struct ChannelEventSink {
    tx: tokio::sync::mpsc::Sender<ExecutionEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: tokio::sync::mpsc::Sender<ExecutionEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.tx
            .blocking_send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
