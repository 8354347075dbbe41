//! Error types for the engine

use thiserror::Error;

/// Errors from evaluating plugin scripts and invoking their `run`
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script evaluation failed: {0}")]
    Eval(String),

    #[error("module does not declare NODE_INFO")]
    MissingNodeInfo,

    #[error("invalid NODE_INFO: {0}")]
    InvalidNodeInfo(String),

    #[error("module declares no callable run()")]
    MissingRun,

    #[error("run() returned an object; object returns are reserved, return a single value or an array of per-port values")]
    MappingReturn,

    #[error("run() returned {got} values, expected {expected}")]
    OutputArity { expected: usize, got: usize },

    #[error("value on port '{port}' cannot cross the script boundary: {message}")]
    Conversion { port: String, message: String },

    #[error("run() raised: {0}")]
    Raised(String),
}

/// Errors from registry operations and plugin lifecycle transitions.
///
/// Per-plugin discovery failures are not surfaced here; they are recorded
/// on the plugin's record so sibling plugins keep loading.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin '{0}' not found on disk")]
    PluginNotFound(String),

    #[error("project '{0}' not found on disk")]
    ProjectNotFound(String),

    #[error("plugin '{0}' must be deactivated before deletion")]
    PluginActive(String),

    #[error("malformed plugin id '{0}', expected '<project>/<plugin>'")]
    MalformedId(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// A node executor failure, captured with whatever trace context the
/// executor substrate can provide
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct NodeRunError {
    pub message: String,
    pub stack_trace: String,
}

impl NodeRunError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            stack_trace: message.clone(),
            message,
        }
    }

    pub fn with_trace(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: stack_trace.into(),
        }
    }
}

impl From<ScriptError> for NodeRunError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Raised(trace) => {
                let message = trace.lines().next().unwrap_or("script error").to_string();
                Self {
                    message,
                    stack_trace: trace,
                }
            }
            other => Self::new(other.to_string()),
        }
    }
}
