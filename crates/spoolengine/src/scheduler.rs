use crate::catalog::HandlerCatalog;
use chrono::{DateTime, Utc};
use spoolcore::{
    BranchLabel, EngineError, ExecutionLog, ExecutionRun, GraphIndex, Handler, HandlerContext,
    HandlerError, NodeExecStatus, NodeExecution, NodeId, NodeKind, NodeSpec, RetryPolicy, RunId,
    RunStatus, Value, WorkflowDefinition,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bounded worker pool size for handler attempts.
    pub max_workers: usize,
    /// How long a cancelled handler gets to return before the engine
    /// abandons it and discards its result.
    pub cancel_grace_ms: u64,
}

/// Everything the scheduler needs to know about one node, resolved
/// against the catalog before the run starts.
pub(crate) struct NodePlan {
    pub spec: NodeSpec,
    pub retry: RetryPolicy,
    pub timeout_ms: u64,
    pub retryable: bool,
    pub handler: Option<Arc<dyn Handler>>,
}

/// Resolve every node against the catalog. Fails fast on unknown
/// action kinds so a run is never started half-resolvable.
pub(crate) fn build_plans(
    workflow: &WorkflowDefinition,
    catalog: &HandlerCatalog,
) -> Result<HashMap<NodeId, NodePlan>, EngineError> {
    let mut plans = HashMap::new();
    for node in &workflow.nodes {
        let plan = match (&node.kind, &node.action_kind) {
            (NodeKind::Trigger, _) | (NodeKind::Delay, _) => NodePlan {
                spec: node.clone(),
                retry: RetryPolicy::none(),
                timeout_ms: 0,
                retryable: false,
                handler: None,
            },
            (_, Some(kind)) => {
                let (descriptor, handler) = catalog.get(kind)?;
                NodePlan {
                    spec: node.clone(),
                    retry: node.retry.clone().unwrap_or_else(|| descriptor.retry.clone()),
                    timeout_ms: node.timeout_ms.unwrap_or(descriptor.timeout_ms),
                    retryable: descriptor.retryable,
                    handler: Some(handler),
                }
            }
            // A condition without an action kind evaluates its inputs
            // directly, no handler involved.
            (NodeKind::Condition, None) => NodePlan {
                spec: node.clone(),
                retry: RetryPolicy::none(),
                timeout_ms: 0,
                retryable: false,
                handler: None,
            },
            (NodeKind::Action, None) => {
                return Err(EngineError::UnknownActionKind(format!(
                    "action node {} declares no action kind",
                    node.id
                )))
            }
        };
        plans.insert(node.id, plan);
    }
    Ok(plans)
}

/// Messages workers and timers report back to the scheduling loop.
/// The loop is the single writer of all node and run status; nothing
/// outside it mutates shared state.
pub(crate) enum SchedulerEvent {
    AttemptSettled {
        node_id: NodeId,
        attempt: u32,
        outcome: Result<HashMap<String, Value>, HandlerError>,
        started_at: DateTime<Utc>,
    },
    DelayElapsed {
        node_id: NodeId,
        started_at: DateTime<Utc>,
    },
    RetryDue {
        node_id: NodeId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Some inbound edges still unresolved.
    Waiting,
    /// All dependencies satisfied, queued for dispatch.
    Ready,
    Running,
    /// Failed attempt, backoff timer armed.
    AwaitingRetry,
    Succeeded,
    Failed,
    Skipped,
}

impl Phase {
    fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed | Phase::Skipped)
    }
}

struct NodeState {
    phase: Phase,
    attempts: u32,
    /// Inbound edges whose source has not yet settled.
    unresolved: usize,
    /// Inbound edges resolved by a succeeded source on a taken branch.
    positive: usize,
}

/// Per-run scheduling loop. Owns the ready queue, the status table
/// and the output table outright; workers only ever talk to it
/// through the event channel.
pub(crate) struct RunDriver {
    run_id: RunId,
    workflow: Arc<WorkflowDefinition>,
    index: GraphIndex,
    plans: HashMap<NodeId, NodePlan>,
    config: SchedulerConfig,
    log: Arc<ExecutionLog>,
    run: Arc<RwLock<ExecutionRun>>,
    cancel: CancellationToken,
    initial_inputs: HashMap<String, Value>,

    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    nodes: HashMap<NodeId, NodeState>,
    outputs: HashMap<NodeId, HashMap<String, Value>>,
    taken_branch: HashMap<NodeId, BranchLabel>,
    ready: VecDeque<NodeId>,
    in_flight: usize,
    timers: usize,
    failed_fast: bool,
    cancelling: bool,
}

impl RunDriver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        workflow: Arc<WorkflowDefinition>,
        plans: HashMap<NodeId, NodePlan>,
        config: SchedulerConfig,
        log: Arc<ExecutionLog>,
        run: Arc<RwLock<ExecutionRun>>,
        cancel: CancellationToken,
        initial_inputs: HashMap<String, Value>,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let index = GraphIndex::new(&workflow);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let nodes = workflow
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id,
                    NodeState {
                        phase: Phase::Waiting,
                        attempts: 0,
                        unresolved: index.inbound(n.id).len(),
                        positive: 0,
                    },
                )
            })
            .collect();
        let driver = Self {
            run_id,
            workflow,
            index,
            plans,
            config,
            log,
            run,
            cancel,
            initial_inputs,
            events_tx,
            nodes,
            outputs: HashMap::new(),
            taken_branch: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: 0,
            timers: 0,
            failed_fast: false,
            cancelling: false,
        };
        (driver, events_rx)
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> RunStatus {
        tracing::info!(run_id = %self.run_id, workflow = %self.workflow.name, "run started");
        self.set_run_status(RunStatus::Running);

        if self.cancel.is_cancelled() {
            self.begin_cancel();
        } else {
            for root in self.index.roots().to_vec() {
                self.make_ready(root);
            }
            self.pump();
        }

        while self.in_flight > 0 || self.timers > 0 {
            let cancel = self.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled(), if !self.cancelling => {
                    self.begin_cancel();
                }
                maybe = events.recv() => {
                    if let Some(event) = maybe {
                        self.handle_event(event);
                        self.pump();
                    }
                }
            }
        }

        let status = self.final_status();
        self.set_run_status(status);
        self.log.close_run(self.run_id);
        tracing::info!(run_id = %self.run_id, ?status, "run finished");
        status
    }

    // ---- dispatch ----

    /// Drain the ready queue. Trigger, delay and inline condition
    /// nodes settle without a worker slot; handler-backed nodes are
    /// dispatched up to the pool bound and the rest stay queued.
    fn pump(&mut self) {
        if self.cancelling || self.failed_fast {
            self.ready.clear();
            return;
        }
        let mut deferred = VecDeque::new();
        while let Some(id) = self.ready.pop_front() {
            let (kind, has_handler) = match self.plans.get(&id) {
                Some(plan) => (plan.spec.kind, plan.handler.is_some()),
                None => continue,
            };
            match kind {
                NodeKind::Trigger => self.complete_inline(id),
                NodeKind::Delay => self.start_delay(id),
                NodeKind::Condition if !has_handler => self.complete_inline(id),
                NodeKind::Action | NodeKind::Condition => {
                    if self.in_flight < self.config.max_workers {
                        self.dispatch_attempt(id);
                    } else {
                        deferred.push_back(id);
                    }
                }
            }
            if self.cancelling || self.failed_fast {
                self.ready.clear();
                return;
            }
        }
        self.ready = deferred;
    }

    /// Settle a node synchronously with its collected inputs passed
    /// through as outputs.
    fn complete_inline(&mut self, id: NodeId) {
        let io = self.collect_inputs(id);
        let now = Utc::now();
        let attempt = {
            let Some(state) = self.nodes.get_mut(&id) else { return };
            state.attempts += 1;
            state.phase = Phase::Running;
            state.attempts
        };
        self.log.append(
            NodeExecution::new(self.run_id, id, attempt, NodeExecStatus::Running)
                .started(now)
                .with_inputs(io.clone()),
        );
        if let Some(state) = self.nodes.get_mut(&id) {
            state.phase = Phase::Succeeded;
        }
        self.log.append(
            NodeExecution::new(self.run_id, id, attempt, NodeExecStatus::Succeeded)
                .started(now)
                .finished(Utc::now())
                .with_inputs(io.clone())
                .with_outputs(io.clone()),
        );
        self.outputs.insert(id, io);
        if self.node_kind(id) == Some(NodeKind::Condition) {
            self.evaluate_branch(id);
        }
        self.resolve_successors(id);
    }

    fn start_delay(&mut self, id: NodeId) {
        let inputs = self.collect_inputs(id);
        let started_at = Utc::now();
        let attempt = {
            let Some(state) = self.nodes.get_mut(&id) else { return };
            state.attempts += 1;
            state.phase = Phase::Running;
            state.attempts
        };
        let delay_ms = self
            .plans
            .get(&id)
            .and_then(|p| p.spec.config.get("delay_ms"))
            .and_then(Value::as_f64)
            .unwrap_or(1_000.0) as u64;
        self.log.append(
            NodeExecution::new(self.run_id, id, attempt, NodeExecStatus::Running)
                .started(started_at)
                .with_inputs(inputs),
        );
        tracing::debug!(node = %id, delay_ms, "delay timer armed");
        self.timers += 1;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(SchedulerEvent::DelayElapsed {
                node_id: id,
                started_at,
            });
        });
    }

    fn dispatch_attempt(&mut self, id: NodeId) {
        let attempt = {
            let Some(state) = self.nodes.get_mut(&id) else { return };
            state.attempts += 1;
            state.phase = Phase::Running;
            state.attempts
        };
        let inputs = self.collect_inputs(id);
        let (handler, timeout_ms, node_config) = match self.plans.get(&id) {
            Some(plan) => match plan.handler.clone() {
                Some(handler) => (handler, plan.timeout_ms, plan.spec.config.clone()),
                None => return,
            },
            None => return,
        };
        self.log.append(
            NodeExecution::new(self.run_id, id, attempt, NodeExecStatus::Running)
                .started(Utc::now())
                .with_inputs(inputs.clone()),
        );
        tracing::debug!(node = %id, attempt, "dispatching handler attempt");

        let ctx = HandlerContext {
            run_id: self.run_id,
            node_id: id,
            attempt,
            config: node_config,
            cancellation: self.cancel.child_token(),
            deadline: Utc::now() + chrono::Duration::milliseconds(timeout_ms as i64),
        };
        self.in_flight += 1;
        let tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let grace = Duration::from_millis(self.config.cancel_grace_ms);
        let timeout = Duration::from_millis(timeout_ms);
        tokio::spawn(async move {
            let started_at = Utc::now();
            let work = handler.execute(inputs, ctx);
            let outcome = tokio::select! {
                res = tokio::time::timeout(timeout, work) => match res {
                    Ok(Ok(out)) => Ok(out),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(HandlerError::Timeout {
                        ms: timeout.as_millis() as u64,
                    }),
                },
                // A handler that ignores the token past the grace
                // period is abandoned and its result discarded.
                _ = async {
                    cancel.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => Err(HandlerError::Cancelled),
            };
            let _ = tx.send(SchedulerEvent::AttemptSettled {
                node_id: id,
                attempt,
                outcome,
                started_at,
            });
        });
    }

    // ---- event handling ----

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::AttemptSettled {
                node_id,
                attempt,
                outcome,
                started_at,
            } => self.on_attempt_settled(node_id, attempt, outcome, started_at),
            SchedulerEvent::DelayElapsed {
                node_id,
                started_at,
            } => self.on_delay_elapsed(node_id, started_at),
            SchedulerEvent::RetryDue { node_id } => self.on_retry_due(node_id),
        }
    }

    fn on_attempt_settled(
        &mut self,
        node_id: NodeId,
        attempt: u32,
        outcome: Result<HashMap<String, Value>, HandlerError>,
        started_at: DateTime<Utc>,
    ) {
        self.in_flight -= 1;
        let inputs = self.collect_inputs(node_id);
        match outcome {
            Ok(outputs) => {
                if let Some(state) = self.nodes.get_mut(&node_id) {
                    state.phase = Phase::Succeeded;
                }
                self.log.append(
                    NodeExecution::new(self.run_id, node_id, attempt, NodeExecStatus::Succeeded)
                        .started(started_at)
                        .finished(Utc::now())
                        .with_inputs(inputs)
                        .with_outputs(outputs.clone()),
                );
                tracing::info!(node = %node_id, attempt, "node succeeded");
                self.outputs.insert(node_id, outputs);
                if self.node_kind(node_id) == Some(NodeKind::Condition) {
                    self.evaluate_branch(node_id);
                }
                self.resolve_successors(node_id);
            }
            Err(err) => {
                let status = match err {
                    HandlerError::Timeout { .. } => NodeExecStatus::TimedOut,
                    _ => NodeExecStatus::Failed,
                };
                self.log.append(
                    NodeExecution::new(self.run_id, node_id, attempt, status)
                        .started(started_at)
                        .finished(Utc::now())
                        .with_inputs(inputs)
                        .with_error(err.to_string()),
                );
                let cancelled = matches!(err, HandlerError::Cancelled);
                let (retryable, max_attempts, delay) = match self.plans.get(&node_id) {
                    Some(plan) => (
                        plan.retryable,
                        plan.retry.max_attempts,
                        plan.retry.delay_before_retry(attempt),
                    ),
                    None => (false, 0, Duration::ZERO),
                };
                let may_retry = !cancelled
                    && !self.cancelling
                    && !self.failed_fast
                    && retryable
                    && attempt < max_attempts;
                if may_retry {
                    if let Some(state) = self.nodes.get_mut(&node_id) {
                        state.phase = Phase::AwaitingRetry;
                    }
                    tracing::info!(
                        node = %node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retry scheduled"
                    );
                    self.timers += 1;
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SchedulerEvent::RetryDue { node_id });
                    });
                } else {
                    if let Some(state) = self.nodes.get_mut(&node_id) {
                        state.phase = Phase::Failed;
                    }
                    tracing::warn!(node = %node_id, attempt, error = %err, "node failed terminally");
                    let continue_on_error = self
                        .plans
                        .get(&node_id)
                        .map(|p| p.spec.continue_on_error)
                        .unwrap_or(false);
                    if self.cancelling {
                        // Settle only; the run is already winding down.
                    } else if continue_on_error {
                        self.resolve_successors(node_id);
                    } else {
                        self.fail_fast();
                    }
                }
            }
        }
    }

    fn on_delay_elapsed(&mut self, node_id: NodeId, started_at: DateTime<Utc>) {
        self.timers = self.timers.saturating_sub(1);
        let (phase, attempt) = match self.nodes.get(&node_id) {
            Some(state) => (state.phase, state.attempts),
            None => return,
        };
        // Cancellation marks pending delays Skipped before the timer
        // fires; the late event is dropped here.
        if phase != Phase::Running {
            return;
        }
        let io = self.collect_inputs(node_id);
        if let Some(state) = self.nodes.get_mut(&node_id) {
            state.phase = Phase::Succeeded;
        }
        self.log.append(
            NodeExecution::new(self.run_id, node_id, attempt, NodeExecStatus::Succeeded)
                .started(started_at)
                .finished(Utc::now())
                .with_inputs(io.clone())
                .with_outputs(io.clone()),
        );
        tracing::debug!(node = %node_id, "delay elapsed");
        self.outputs.insert(node_id, io);
        self.resolve_successors(node_id);
    }

    fn on_retry_due(&mut self, node_id: NodeId) {
        self.timers = self.timers.saturating_sub(1);
        let phase = match self.nodes.get(&node_id) {
            Some(state) => state.phase,
            None => return,
        };
        if phase != Phase::AwaitingRetry {
            return;
        }
        tracing::debug!(node = %node_id, "retry due");
        self.make_ready(node_id);
    }

    // ---- readiness and skip propagation ----

    fn make_ready(&mut self, id: NodeId) {
        if self.cancelling || self.failed_fast {
            self.mark_skipped(id);
            return;
        }
        if let Some(state) = self.nodes.get_mut(&id) {
            state.phase = Phase::Ready;
        }
        self.ready.push_back(id);
    }

    /// Resolve every outbound edge of a settled node. An edge is
    /// positive only when the source succeeded and, for condition
    /// outputs, sits on the taken branch. A target with all edges
    /// resolved is dispatched if any edge is positive, else skipped.
    fn resolve_successors(&mut self, id: NodeId) {
        let source_phase = match self.nodes.get(&id) {
            Some(state) => state.phase,
            None => return,
        };
        let taken = self.taken_branch.get(&id).copied();
        let edges: Vec<_> = self.index.outbound(id).to_vec();
        for edge in edges {
            let positive = source_phase == Phase::Succeeded
                && match edge.branch {
                    None => true,
                    Some(branch) => taken == Some(branch),
                };
            let decision = {
                let Some(target) = self.nodes.get_mut(&edge.target_node) else {
                    continue;
                };
                target.unresolved = target.unresolved.saturating_sub(1);
                if positive {
                    target.positive += 1;
                }
                if target.unresolved == 0 && target.phase == Phase::Waiting {
                    Some(target.positive > 0)
                } else {
                    None
                }
            };
            match decision {
                Some(true) => self.make_ready(edge.target_node),
                Some(false) => self.mark_skipped(edge.target_node),
                None => {}
            }
        }
    }

    /// Skip propagates: a skipped node resolves its own successors as
    /// negative edges, transitively.
    fn mark_skipped(&mut self, id: NodeId) {
        let attempt = {
            let Some(state) = self.nodes.get_mut(&id) else { return };
            if state.phase.is_terminal() {
                return;
            }
            state.phase = Phase::Skipped;
            state.attempts.max(1)
        };
        self.log.append(
            NodeExecution::new(self.run_id, id, attempt, NodeExecStatus::Skipped)
                .finished(Utc::now()),
        );
        tracing::debug!(node = %id, "node skipped");
        self.resolve_successors(id);
    }

    /// Default failure policy: one terminal failure skips everything
    /// not yet started and fails the run once in-flight work settles.
    fn fail_fast(&mut self) {
        self.failed_fast = true;
        self.ready.clear();
        let pending: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, s)| {
                matches!(s.phase, Phase::Waiting | Phase::Ready | Phase::AwaitingRetry)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.mark_skipped(id);
        }
    }

    /// Stop dispatch immediately; queued work becomes Skipped,
    /// in-flight handlers get their grace period via the token.
    fn begin_cancel(&mut self) {
        self.cancelling = true;
        tracing::info!(run_id = %self.run_id, "cancellation requested, stopping dispatch");
        if let Ok(mut run) = self.run.write() {
            run.cancel_requested = true;
        }
        self.ready.clear();
        let mut released_timers = 0;
        let pending: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, s)| {
                let is_running_delay = s.phase == Phase::Running
                    && self
                        .plans
                        .get(id)
                        .map(|p| p.spec.kind == NodeKind::Delay)
                        .unwrap_or(false);
                // Backoff and delay timers for nodes skipped here are
                // released up front so the run closes without waiting
                // for their sleeps to elapse; the late events are
                // dropped by the phase checks.
                if s.phase == Phase::AwaitingRetry || is_running_delay {
                    released_timers += 1;
                }
                matches!(s.phase, Phase::Waiting | Phase::Ready | Phase::AwaitingRetry)
                    || is_running_delay
            })
            .map(|(id, _)| *id)
            .collect();
        self.timers = self.timers.saturating_sub(released_timers);
        for id in pending {
            self.mark_skipped(id);
        }
    }

    // ---- helpers ----

    fn collect_inputs(&self, id: NodeId) -> HashMap<String, Value> {
        let inbound = self.index.inbound(id);
        if inbound.is_empty() {
            return self.initial_inputs.clone();
        }
        let mut inputs = HashMap::new();
        for edge in inbound {
            let Some(source) = self.nodes.get(&edge.source_node) else {
                continue;
            };
            if source.phase != Phase::Succeeded {
                continue;
            }
            if let Some(branch) = edge.branch {
                if self.taken_branch.get(&edge.source_node).copied() != Some(branch) {
                    continue;
                }
            }
            if let Some(outs) = self.outputs.get(&edge.source_node) {
                if let Some(value) = outs.get(&edge.source_port) {
                    inputs.insert(edge.target_port.clone(), value.clone());
                }
            }
        }
        inputs
    }

    /// Exactly one branch is taken per run; a missing or non-truthy
    /// branch port value takes the false branch.
    fn evaluate_branch(&mut self, id: NodeId) {
        let port = self
            .plans
            .get(&id)
            .and_then(|p| p.spec.config.get("branch_port"))
            .and_then(Value::as_str)
            .unwrap_or("result")
            .to_string();
        let truthy = self
            .outputs
            .get(&id)
            .and_then(|outs| outs.get(&port))
            .map(Value::is_truthy)
            .unwrap_or(false);
        let label = if truthy {
            BranchLabel::True
        } else {
            BranchLabel::False
        };
        tracing::debug!(node = %id, branch = label.port_name(), "condition branch taken");
        self.taken_branch.insert(id, label);
    }

    fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.plans.get(&id).map(|p| p.spec.kind)
    }

    fn set_run_status(&self, status: RunStatus) {
        if let Ok(mut run) = self.run.write() {
            run.status = status;
            match status {
                RunStatus::Running => run.started_at = Utc::now(),
                s if s.is_terminal() => run.finished_at = Some(Utc::now()),
                _ => {}
            }
        }
    }

    fn final_status(&self) -> RunStatus {
        if self.cancelling {
            RunStatus::Cancelled
        } else if self.failed_fast {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}
