use async_trait::async_trait;
use spoolcore::{
    BranchLabel, EngineError, Handler, HandlerContext, HandlerDescriptor, HandlerError,
    NodeExecStatus, NodeExecution, NodeId, NodeSpec, RetryPolicy, RunStatus, Value,
    WorkflowDefinition,
};
use spoolengine::{EngineConfig, HandlerCatalog, WorkflowRuntime};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

/// Succeeds immediately with a fixed output map.
struct StaticHandler {
    outputs: HashMap<String, Value>,
}

#[async_trait]
impl Handler for StaticHandler {
    async fn execute(
        &self,
        _input: HashMap<String, Value>,
        _ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        Ok(self.outputs.clone())
    }
}

/// Always fails.
struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    async fn execute(
        &self,
        _input: HashMap<String, Value>,
        _ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        Err(HandlerError::ExecutionFailed("injected failure".into()))
    }
}

/// Fails the first `fail_times` calls, then succeeds. Also detects
/// overlapping invocations, which the engine must never produce for
/// a single node.
struct FlakyHandler {
    fail_times: u32,
    calls: AtomicU32,
    in_flight: AtomicBool,
    overlapped: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn execute(
        &self,
        _input: HashMap<String, Value>,
        _ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        if call < self.fail_times {
            Err(HandlerError::ExecutionFailed(format!("flake {}", call)))
        } else {
            Ok(HashMap::from([("done".to_string(), Value::Bool(true))]))
        }
    }
}

/// Blocks until the run's cancellation token fires, then returns
/// promptly, as the handler contract requires.
struct BlockingHandler {
    started: Arc<Notify>,
}

#[async_trait]
impl Handler for BlockingHandler {
    async fn execute(
        &self,
        _input: HashMap<String, Value>,
        ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        self.started.notify_one();
        ctx.cancellation.cancelled().await;
        Err(HandlerError::Cancelled)
    }
}

/// Sleeps past any reasonable per-attempt deadline.
struct SlowHandler;

#[async_trait]
impl Handler for SlowHandler {
    async fn execute(
        &self,
        _input: HashMap<String, Value>,
        _ctx: HandlerContext,
    ) -> Result<HashMap<String, Value>, HandlerError> {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        Ok(HashMap::new())
    }
}

struct TestBed {
    runtime: WorkflowRuntime,
    overlapped: Arc<AtomicBool>,
    block_started: Arc<Notify>,
}

fn test_bed() -> TestBed {
    init_tracing();
    let overlapped = Arc::new(AtomicBool::new(false));
    let block_started = Arc::new(Notify::new());

    let mut catalog = HandlerCatalog::new();
    catalog.register(
        HandlerDescriptor::new("test.analyze").with_category("test"),
        Arc::new(StaticHandler {
            outputs: HashMap::from([
                ("approved".to_string(), Value::Bool(true)),
                ("confidence".to_string(), Value::Number(0.96)),
            ]),
        }),
    );
    catalog.register(
        HandlerDescriptor::new("test.reject").with_category("test"),
        Arc::new(StaticHandler {
            outputs: HashMap::from([
                ("approved".to_string(), Value::Bool(false)),
                ("confidence".to_string(), Value::Number(0.31)),
            ]),
        }),
    );
    catalog.register(
        HandlerDescriptor::new("test.ok").with_category("test"),
        Arc::new(StaticHandler {
            outputs: HashMap::from([("ok".to_string(), Value::Bool(true))]),
        }),
    );
    catalog.register(
        HandlerDescriptor::new("test.fail")
            .with_category("test")
            .with_retry(RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
                backoff_multiplier: 1.0,
                max_delay_ms: 10,
            }),
        Arc::new(FailingHandler),
    );
    catalog.register(
        HandlerDescriptor::new("test.flaky")
            .with_category("test")
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                backoff_multiplier: 2.0,
                max_delay_ms: 10,
            }),
        Arc::new(FlakyHandler {
            fail_times: 2,
            calls: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            overlapped: Arc::clone(&overlapped),
        }),
    );
    catalog.register(
        HandlerDescriptor::new("test.block").with_category("test"),
        Arc::new(BlockingHandler {
            started: Arc::clone(&block_started),
        }),
    );
    catalog.register(
        HandlerDescriptor::new("test.slow")
            .with_category("test")
            .with_retry(RetryPolicy::none()),
        Arc::new(SlowHandler),
    );

    let runtime = WorkflowRuntime::with_config(
        Arc::new(catalog),
        EngineConfig {
            max_workers: 4,
            cancel_grace_ms: 500,
            log_buffer: 256,
        },
    );
    TestBed {
        runtime,
        overlapped,
        block_started,
    }
}

/// Last terminal status per node, from the ordered history.
fn terminal_statuses(history: &[NodeExecution]) -> HashMap<NodeId, NodeExecStatus> {
    let mut statuses = HashMap::new();
    for record in history {
        if record.status.is_terminal() {
            statuses.insert(record.node_id, record.status);
        }
    }
    statuses
}

fn attempts_of(history: &[NodeExecution], node: NodeId) -> Vec<&NodeExecution> {
    history.iter().filter(|r| r.node_id == node).collect()
}

/// Trigger -> AIAnalysis -> Condition -> {Approval, Email}, the
/// approval path taken.
fn scenario_workflow(analysis_kind: &str) -> (WorkflowDefinition, [NodeId; 5]) {
    let mut wf = WorkflowDefinition::new("document approval");
    let trigger = wf.add_node(NodeSpec::trigger().with_name("upload"));
    let analyze = wf.add_node(
        NodeSpec::action(analysis_kind)
            .with_name("ai analysis")
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                backoff_multiplier: 1.0,
                max_delay_ms: 5,
            }),
    );
    let cond = wf.add_node(NodeSpec::condition().with_name("approved?"));
    let approval = wf.add_node(NodeSpec::action("test.ok").with_name("approval request"));
    let email = wf.add_node(NodeSpec::action("test.ok").with_name("rejection email"));
    wf.connect(trigger, "document", analyze, "document");
    wf.connect(analyze, "approved", cond, "result");
    wf.connect_branch(cond, BranchLabel::True, approval, "document");
    wf.connect_branch(cond, BranchLabel::False, email, "body");
    (wf, [trigger, analyze, cond, approval, email])
}

#[tokio::test]
async fn linear_run_succeeds_and_visits_every_node_once() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("linear");
    let trigger = wf.add_node(NodeSpec::trigger());
    let first = wf.add_node(NodeSpec::action("test.ok"));
    let second = wf.add_node(NodeSpec::action("test.ok"));
    wf.connect(trigger, "out", first, "in");
    wf.connect(first, "ok", second, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let history = bed.runtime.history(run_id).await.unwrap();
    let statuses = terminal_statuses(&history);
    for node in [trigger, first, second] {
        assert_eq!(statuses.get(&node), Some(&NodeExecStatus::Succeeded));
        let terminal: Vec<_> = attempts_of(&history, node)
            .into_iter()
            .filter(|r| r.status.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1, "node executed exactly once");
        assert_eq!(terminal[0].attempt, 1);
    }
    // Sequence numbers are strictly increasing.
    for pair in history.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
}

#[tokio::test]
async fn taken_branch_executes_and_untaken_branch_is_skipped() {
    let bed = test_bed();
    let (wf, [_, analyze, cond, approval, email]) = scenario_workflow("test.analyze");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let history = bed.runtime.history(run_id).await.unwrap();
    let statuses = terminal_statuses(&history);
    assert_eq!(statuses.get(&analyze), Some(&NodeExecStatus::Succeeded));
    assert_eq!(statuses.get(&cond), Some(&NodeExecStatus::Succeeded));
    assert_eq!(statuses.get(&approval), Some(&NodeExecStatus::Succeeded));
    assert_eq!(statuses.get(&email), Some(&NodeExecStatus::Skipped));
    // Exactly one branch taken: the email node never ran.
    assert!(attempts_of(&history, email)
        .iter()
        .all(|r| r.status == NodeExecStatus::Skipped));
}

#[tokio::test]
async fn join_node_runs_when_only_one_branch_feeds_it() {
    let bed = test_bed();
    let (mut wf, [_, _, _, approval, email]) = scenario_workflow("test.analyze");
    // Both branches converge; the untaken side settles Skipped and the
    // join must still run off the taken side alone.
    let archive = wf.add_node(NodeSpec::action("test.ok").with_name("archive"));
    wf.connect(approval, "ok", archive, "record");
    wf.connect(email, "ok", archive, "record");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let statuses = terminal_statuses(&bed.runtime.history(run_id).await.unwrap());
    assert_eq!(statuses.get(&approval), Some(&NodeExecStatus::Succeeded));
    assert_eq!(statuses.get(&email), Some(&NodeExecStatus::Skipped));
    assert_eq!(statuses.get(&archive), Some(&NodeExecStatus::Succeeded));
}

#[tokio::test]
async fn false_branch_routes_to_the_other_successor() {
    let bed = test_bed();
    let (wf, [_, analyze, cond, approval, email]) = scenario_workflow("test.reject");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let statuses = terminal_statuses(&bed.runtime.history(run_id).await.unwrap());
    assert_eq!(statuses.get(&analyze), Some(&NodeExecStatus::Succeeded));
    assert_eq!(statuses.get(&cond), Some(&NodeExecStatus::Succeeded));
    assert_eq!(statuses.get(&approval), Some(&NodeExecStatus::Skipped));
    assert_eq!(statuses.get(&email), Some(&NodeExecStatus::Succeeded));
}

#[tokio::test]
async fn exhausted_retries_fail_the_run_and_skip_downstream() {
    let bed = test_bed();
    let (wf, [_, analyze, cond, approval, email]) = scenario_workflow("test.fail");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Failed);

    let history = bed.runtime.history(run_id).await.unwrap();
    let statuses = terminal_statuses(&history);
    assert_eq!(statuses.get(&analyze), Some(&NodeExecStatus::Failed));
    for node in [cond, approval, email] {
        assert_eq!(statuses.get(&node), Some(&NodeExecStatus::Skipped));
    }

    // Three attempts, strictly sequential, never more than allowed.
    let failures: Vec<_> = attempts_of(&history, analyze)
        .into_iter()
        .filter(|r| r.status == NodeExecStatus::Failed)
        .collect();
    assert_eq!(failures.len(), 3);
    assert_eq!(
        failures.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(failures.iter().all(|r| r.error_message.is_some()));
}

#[tokio::test]
async fn flaky_handler_recovers_within_retry_budget() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("flaky");
    let trigger = wf.add_node(NodeSpec::trigger());
    let flaky = wf.add_node(NodeSpec::action("test.flaky"));
    wf.connect(trigger, "out", flaky, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let history = bed.runtime.history(run_id).await.unwrap();
    let succeeded: Vec<_> = attempts_of(&history, flaky)
        .into_iter()
        .filter(|r| r.status == NodeExecStatus::Succeeded)
        .collect();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].attempt, 3);
    assert!(
        !bed.overlapped.load(Ordering::SeqCst),
        "attempts for one node must never overlap"
    );
}

#[tokio::test]
async fn continue_on_error_keeps_unrelated_branch_alive() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("partial");
    let trigger = wf.add_node(NodeSpec::trigger());
    let doomed = wf.add_node(NodeSpec::action("test.fail").with_continue_on_error());
    let dependent = wf.add_node(NodeSpec::action("test.ok"));
    let unrelated = wf.add_node(NodeSpec::action("test.ok"));
    wf.connect(trigger, "out", doomed, "in");
    wf.connect(doomed, "out", dependent, "in");
    wf.connect(trigger, "out", unrelated, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let statuses = terminal_statuses(&bed.runtime.history(run_id).await.unwrap());
    assert_eq!(statuses.get(&doomed), Some(&NodeExecStatus::Failed));
    assert_eq!(statuses.get(&dependent), Some(&NodeExecStatus::Skipped));
    assert_eq!(statuses.get(&unrelated), Some(&NodeExecStatus::Succeeded));
}

#[tokio::test]
async fn cancelling_a_run_skips_queued_nodes() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("cancel");
    let trigger = wf.add_node(NodeSpec::trigger());
    let blocker = wf.add_node(NodeSpec::action("test.block"));
    let downstream = wf.add_node(NodeSpec::action("test.ok"));
    wf.connect(trigger, "out", blocker, "in");
    wf.connect(blocker, "out", downstream, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    // Wait until the handler is provably mid-flight before cancelling.
    bed.block_started.notified().await;
    bed.runtime.cancel_run(run_id).await.unwrap();

    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Cancelled);
    let run = bed.runtime.run(run_id).await.unwrap();
    assert!(run.cancel_requested);
    assert!(run.finished_at.is_some());

    let statuses = terminal_statuses(&bed.runtime.history(run_id).await.unwrap());
    assert_eq!(statuses.get(&downstream), Some(&NodeExecStatus::Skipped));
}

#[tokio::test]
async fn delay_node_does_not_block_sibling_branch() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("delay");
    let trigger = wf.add_node(NodeSpec::trigger());
    let delay = wf.add_node(NodeSpec::delay(300));
    let after_delay = wf.add_node(NodeSpec::action("test.ok"));
    let quick = wf.add_node(NodeSpec::action("test.ok"));
    wf.connect(trigger, "out", delay, "in");
    wf.connect(delay, "out", after_delay, "in");
    wf.connect(trigger, "out", quick, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Succeeded);

    let history = bed.runtime.history(run_id).await.unwrap();
    let statuses = terminal_statuses(&history);
    for node in [delay, after_delay, quick] {
        assert_eq!(statuses.get(&node), Some(&NodeExecStatus::Succeeded));
    }
    // The sibling finished while the delay was still pending.
    let quick_done = history
        .iter()
        .find(|r| r.node_id == quick && r.status == NodeExecStatus::Succeeded)
        .map(|r| r.seq)
        .unwrap();
    let delay_done = history
        .iter()
        .find(|r| r.node_id == delay && r.status == NodeExecStatus::Succeeded)
        .map(|r| r.seq)
        .unwrap();
    assert!(quick_done < delay_done);
}

#[tokio::test]
async fn attempt_deadline_is_recorded_as_timed_out() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("timeout");
    let trigger = wf.add_node(NodeSpec::trigger());
    let slow = wf.add_node(NodeSpec::action("test.slow").with_timeout_ms(50));
    wf.connect(trigger, "out", slow, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    assert_eq!(bed.runtime.wait_for_run(run_id).await.unwrap(), RunStatus::Failed);

    let history = bed.runtime.history(run_id).await.unwrap();
    let statuses = terminal_statuses(&history);
    assert_eq!(statuses.get(&slow), Some(&NodeExecStatus::TimedOut));
    let timed_out = history
        .iter()
        .find(|r| r.node_id == slow && r.status == NodeExecStatus::TimedOut)
        .unwrap();
    assert!(timed_out.error_message.as_deref().unwrap_or("").contains("timed out"));
}

#[tokio::test]
async fn invalid_workflow_never_produces_a_run() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("invalid");
    wf.add_node(NodeSpec::trigger());
    wf.add_node(NodeSpec::action("test.ok")); // orphan
    let wf_id = bed.runtime.register_workflow(wf).await;

    match bed.runtime.start_run(wf_id, HashMap::new()).await {
        Err(EngineError::Validation(errors)) => assert_eq!(errors.len(), 1),
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn unknown_action_kind_is_rejected_at_start() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("unknown");
    let trigger = wf.add_node(NodeSpec::trigger());
    let bogus = wf.add_node(NodeSpec::action("no.such.kind"));
    wf.connect(trigger, "out", bogus, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    match bed.runtime.start_run(wf_id, HashMap::new()).await {
        Err(EngineError::UnknownActionKind(kind)) => assert_eq!(kind, "no.such.kind"),
        other => panic!("expected unknown action kind, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn subscribe_streams_records_until_the_run_finishes() {
    let bed = test_bed();
    let mut wf = WorkflowDefinition::new("stream");
    let trigger = wf.add_node(NodeSpec::trigger());
    let action = wf.add_node(NodeSpec::action("test.ok"));
    wf.connect(trigger, "out", action, "in");
    let wf_id = bed.runtime.register_workflow(wf).await;

    // Subscribing through the log directly so no append is missed.
    let log = Arc::clone(bed.runtime.log());
    let run_id = bed.runtime.start_run(wf_id, HashMap::new()).await.unwrap();
    let mut stream = log.subscribe(run_id);

    let mut streamed = Vec::new();
    while let Some(record) = stream.next().await {
        streamed.push(record);
    }
    assert_eq!(bed.runtime.run_status(run_id).await.unwrap(), RunStatus::Succeeded);
    assert!(!streamed.is_empty());
    // The stream ends only after the run is terminal, and what it saw
    // is a suffix of the replayable history.
    let history = bed.runtime.history(run_id).await.unwrap();
    let first_seq = streamed[0].seq;
    for (record, replay) in streamed.iter().zip(history.iter().skip(first_seq as usize)) {
        assert_eq!(record.seq, replay.seq);
        assert_eq!(record.node_id, replay.node_id);
    }
}
