//! Core abstractions for the spool workflow engine
//!
//! This crate provides the graph model, the handler contract, the
//! execution log, and the error taxonomy that the runtime crates
//! build on.

mod error;
mod graph;
mod handler;
mod log;
mod run;
mod value;
mod workflow;

pub use error::{EngineError, HandlerError, ValidationError};
pub use graph::GraphIndex;
pub use handler::{
    Handler, HandlerContext, HandlerDescriptor, PortSpec, PortType, RetryPolicy,
};
pub use log::{ExecutionLog, LogStream};
pub use run::{ExecutionRun, NodeExecStatus, NodeExecution, RunId, RunStatus};
pub use value::Value;
pub use workflow::{
    BranchLabel, Connection, ConnectionId, NodeId, NodeKind, NodeSpec, Position,
    WorkflowDefinition, WorkflowId,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
