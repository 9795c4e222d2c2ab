//! Workflow execution runtime
//!
//! This crate provides the handler catalog, the per-run scheduler that
//! drives handlers respecting graph dependencies, and the run control
//! API built on top of both.

mod catalog;
mod runtime;
mod scheduler;

pub use catalog::HandlerCatalog;
pub use runtime::{EngineConfig, WorkflowRuntime};
