use crate::value::Value;
use crate::workflow::{NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type RunId = Uuid;

/// Lifecycle of a whole run. Terminal once it leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution of a workflow definition. Mutated only by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

impl ExecutionRun {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            cancel_requested: false,
        }
    }
}

/// Status of a single node execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeExecStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl NodeExecStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeExecStatus::Queued | NodeExecStatus::Running)
    }
}

/// One record in the execution log. Never mutated after append; a
/// retry appends a fresh record with the next attempt number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub run_id: RunId,
    pub node_id: NodeId,
    /// 1-based. Strictly sequential per node within a run.
    pub attempt: u32,
    pub status: NodeExecStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_snapshot: HashMap<String, Value>,
    pub output_snapshot: HashMap<String, Value>,
    pub error_message: Option<String>,
    /// Monotonic within the run, assigned by the log at append time.
    pub seq: u64,
}

impl NodeExecution {
    pub fn new(run_id: RunId, node_id: NodeId, attempt: u32, status: NodeExecStatus) -> Self {
        Self {
            run_id,
            node_id,
            attempt,
            status,
            started_at: None,
            finished_at: None,
            input_snapshot: HashMap::new(),
            output_snapshot: HashMap::new(),
            error_message: None,
            seq: 0,
        }
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.input_snapshot = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.output_snapshot = outputs;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }
}
