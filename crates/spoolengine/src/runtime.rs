use crate::catalog::HandlerCatalog;
use crate::scheduler::{build_plans, RunDriver, SchedulerConfig};
use spoolcore::{
    EngineError, ExecutionLog, ExecutionRun, LogStream, NodeExecution, RunId, RunStatus, Value,
    WorkflowDefinition, WorkflowId,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub cancel_grace_ms: u64,
    pub log_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            cancel_grace_ms: 2_000,
            log_buffer: 1_024,
        }
    }
}

struct RunEntry {
    record: Arc<StdRwLock<ExecutionRun>>,
    cancel: CancellationToken,
}

/// Run control surface over the catalog, scheduler and log
pub struct WorkflowRuntime {
    catalog: Arc<HandlerCatalog>,
    config: EngineConfig,
    log: Arc<ExecutionLog>,
    workflows: RwLock<HashMap<WorkflowId, Arc<WorkflowDefinition>>>,
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

impl WorkflowRuntime {
    pub fn new(catalog: Arc<HandlerCatalog>) -> Self {
        Self::with_config(catalog, EngineConfig::default())
    }

    pub fn with_config(catalog: Arc<HandlerCatalog>, config: EngineConfig) -> Self {
        let log = Arc::new(ExecutionLog::new(config.log_buffer));
        Self {
            catalog,
            config,
            log,
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<HandlerCatalog> {
        &self.catalog
    }

    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    // ---- workflow store ----

    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> WorkflowId {
        let id = workflow.id;
        self.workflows.write().await.insert(id, Arc::new(workflow));
        id
    }

    pub async fn workflow(&self, id: WorkflowId) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(&id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.read().await.values().cloned().collect()
    }

    pub async fn remove_workflow(&self, id: WorkflowId) -> bool {
        self.workflows.write().await.remove(&id).is_some()
    }

    // ---- run control ----

    /// Validate the definition and start a run against it. Validation
    /// errors and unknown action kinds are returned synchronously and
    /// never produce a run.
    pub async fn start_run(
        &self,
        workflow_id: WorkflowId,
        inputs: HashMap<String, Value>,
    ) -> Result<RunId, EngineError> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let errors = workflow.validate();
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        let plans = build_plans(&workflow, &self.catalog)?;

        let run = ExecutionRun::new(workflow_id);
        let run_id = run.id;
        let record = Arc::new(StdRwLock::new(run));
        let cancel = CancellationToken::new();
        self.runs.write().await.insert(
            run_id,
            RunEntry {
                record: Arc::clone(&record),
                cancel: cancel.clone(),
            },
        );

        let (driver, events) = RunDriver::new(
            run_id,
            workflow,
            plans,
            SchedulerConfig {
                max_workers: self.config.max_workers,
                cancel_grace_ms: self.config.cancel_grace_ms,
            },
            Arc::clone(&self.log),
            record,
            cancel,
            inputs,
        );
        tokio::spawn(driver.run(events));
        Ok(run_id)
    }

    /// Request cooperative cancellation. Idempotent; a no-op on runs
    /// that already reached a terminal status.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(&run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if let Ok(mut run) = entry.record.write() {
            if run.status.is_terminal() {
                return Ok(());
            }
            run.cancel_requested = true;
        }
        entry.cancel.cancel();
        Ok(())
    }

    pub async fn run_status(&self, run_id: RunId) -> Result<RunStatus, EngineError> {
        Ok(self.run(run_id).await?.status)
    }

    /// Snapshot of the run record.
    pub async fn run(&self, run_id: RunId) -> Result<ExecutionRun, EngineError> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(&run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        entry
            .record
            .read()
            .map(|run| run.clone())
            .map_err(|_| EngineError::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run reaches a terminal status and return it.
    pub async fn wait_for_run(&self, run_id: RunId) -> Result<RunStatus, EngineError> {
        let mut stream = self.subscribe(run_id).await?;
        while stream.next().await.is_some() {}
        self.run_status(run_id).await
    }

    // ---- log streaming ----

    pub async fn history(&self, run_id: RunId) -> Result<Vec<NodeExecution>, EngineError> {
        // Known-run check keeps a typo from yielding an empty history.
        let _ = self.run(run_id).await?;
        Ok(self.log.history(run_id))
    }

    pub async fn subscribe(&self, run_id: RunId) -> Result<LogStream, EngineError> {
        let _ = self.run(run_id).await?;
        Ok(self.log.subscribe(run_id))
    }
}
