//! Patchflow core - data model for graph-based workflow execution
//!
//! This crate holds everything the engine and a transport layer need to
//! agree on:
//!
//! - The workflow definition (nodes, edges, JSON round-trip safe)
//! - Node specifications (ports, type tags, defaults)
//! - The execution event stream and the `EventSink` abstraction
//! - Value summarization for events (arrays, function envelopes)
//!
//! The crate is deliberately free of execution logic; the scheduler, the
//! plugin registry and the validator live in `patchflow-engine`.

pub mod events;
pub mod spec;
pub mod value;
pub mod workflow;

// Re-export key types
pub use events::{
    ChannelEventSink, EventError, EventSink, ExecutionEvent, LogLevel, NodeErrorKind, NodeStatus,
    NullEventSink, UnavailableReason, VecEventSink,
};
pub use spec::{NodeSpec, PortSpec, SpecError};
pub use value::PortValues;
pub use workflow::{EdgeId, NodeId, Position, Workflow, WorkflowEdge, WorkflowNode};
