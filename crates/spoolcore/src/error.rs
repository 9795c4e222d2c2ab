use crate::workflow::{ConnectionId, NodeId};
use thiserror::Error;

/// Top-level error for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow is invalid: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("no handler registered for action kind: {0}")]
    UnknownActionKind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error returned by a handler attempt. Subject to the retry policy
/// except for `Cancelled`, which is terminal.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Structural problem in a workflow definition. Any non-empty set of
/// these blocks run start; never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cycle detected through nodes {0:?}")]
    CycleDetected(Vec<NodeId>),

    #[error("node id {0} is declared more than once")]
    DuplicateNodeId(NodeId),

    #[error("node {0} has no inbound connection")]
    OrphanNode(NodeId),

    #[error("connection {0} references a missing node or undeclared port")]
    DanglingConnection(ConnectionId),

    #[error("condition node {0} must have exactly one true and one false branch")]
    MalformedConditionBranches(NodeId),

    #[error("connection {0} joins ports of incompatible types")]
    PortTypeMismatch(ConnectionId),
}
