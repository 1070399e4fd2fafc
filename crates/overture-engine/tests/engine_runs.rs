//! End-to-end runs against a scripted model client.
//!
//! Each test wires a [`Runner`] to a client that replays a fixed action
//! script per reasoning loop, then asserts on the full outward event stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use overture_engine::approval::{ApprovalSource, AutoApprove};
use overture_engine::model::cache::ModelCache;
use overture_engine::model::{ClientFactory, LoopRequest, ModelClient, ModelConfig, RawLoopEvent};
use overture_engine::middleware::{Middleware, RunOutcome};
use overture_engine::{
    AgentEvent, EngineConfig, EngineError, Result, RunContext, Runner, StepStatus, ToolRegistry,
};

// ---------------------------------------------------------------------------
// Scripted client
// ---------------------------------------------------------------------------

/// One action a scripted reasoning loop performs.
#[derive(Clone)]
enum Action {
    /// Emit a token delta.
    Token(&'static str),
    /// Invoke a tool from the request's tool set and emit start/end events.
    CallTool { tool: &'static str, input: Value },
    /// Fail the loop.
    Fail(&'static str),
    /// Stall until the run is cancelled or the test ends.
    Hang,
}

/// Replays one action script per `start_loop` call, in order, and one queued
/// reply per `complete_structured` call.
struct ScriptedClient {
    scripts: Mutex<VecDeque<Vec<Action>>>,
    structured: Mutex<VecDeque<String>>,
    loops_started: AtomicUsize,
    structured_calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(scripts: Vec<Vec<Action>>, structured: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            structured: Mutex::new(structured.into_iter().map(String::from).collect()),
            loops_started: AtomicUsize::new(0),
            structured_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn start_loop(
        &self,
        request: LoopRequest,
        ctx: Arc<RunContext>,
    ) -> Result<mpsc::Receiver<RawLoopEvent>> {
        self.loops_started.fetch_add(1, Ordering::SeqCst);
        let actions = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("more loops started than scripts provided");
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for (n, action) in actions.into_iter().enumerate() {
                match action {
                    Action::Token(content) => {
                        let _ = tx
                            .send(RawLoopEvent::TokenDelta {
                                content: content.to_string(),
                            })
                            .await;
                    }
                    Action::CallTool { tool, input } => {
                        let call_id = format!("call-{n}");
                        let _ = tx
                            .send(RawLoopEvent::ToolCallStart {
                                call_id: call_id.clone(),
                                tool: tool.to_string(),
                                input: input.to_string(),
                            })
                            .await;
                        let handler = request
                            .tools
                            .iter()
                            .find(|t| t.name() == tool)
                            .expect("scripted tool not in the offered set")
                            .clone();
                        let output = match handler.invoke(input, &ctx).await {
                            Ok(out) => out,
                            Err(e) => format!("[ERROR] {e}"),
                        };
                        let _ = tx
                            .send(RawLoopEvent::ToolCallEnd {
                                call_id,
                                tool: tool.to_string(),
                                output,
                            })
                            .await;
                    }
                    Action::Fail(message) => {
                        let _ = tx
                            .send(RawLoopEvent::LoopError {
                                message: message.to_string(),
                            })
                            .await;
                        return;
                    }
                    Action::Hang => {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn complete_structured(&self, _prompt: &str, _schema: Value) -> Result<String> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        self.structured
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::Internal("no structured reply queued".into()))
    }
}

struct FixedFactory {
    client: Arc<ScriptedClient>,
}

impl ClientFactory for FixedFactory {
    fn build(&self, _config: &ModelConfig, _streaming: bool) -> Result<Arc<dyn ModelClient>> {
        Ok(self.client.clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn runner_for(
    client: Arc<ScriptedClient>,
    config: Arc<EngineConfig>,
    approval: Arc<dyn ApprovalSource>,
) -> Runner {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("overture_engine=debug")
        .try_init();
    let cache = Arc::new(ModelCache::new(
        config,
        Arc::new(FixedFactory { client }),
    ));
    Runner::new(cache, Arc::new(ToolRegistry::new()), approval)
}

fn context(config: &Arc<EngineConfig>, message: &str) -> RunContext {
    let mut ctx = RunContext::new("test-session", Arc::clone(config));
    ctx.message = message.to_string();
    ctx
}

async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}

fn tokens(events: &[AgentEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Token { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn step_updates(events: &[AgentEvent]) -> Vec<(u32, StepStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::PlanUpdated {
                step_id, status, ..
            } => Some((*step_id, *status)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_only_run_ends_with_done_and_no_plan_events() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(vec![vec![Action::Token("Hello"), Action::Token(" world")]], vec![]);
    let runner = runner_for(client.clone(), config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "hi"))).await;

    assert_eq!(tokens(&events), "Hello world");
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    assert!(!kinds(&events).iter().any(|k| k.starts_with("plan-")));
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plan_commit_runs_both_steps_and_discards_trailing_output() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(
        vec![
            vec![
                Action::Token("Let me plan this."),
                Action::CallTool {
                    tool: "plan_create",
                    input: json!({ "title": "research", "steps": ["search", "summarize"] }),
                },
                Action::Token("MUST NOT APPEAR"),
            ],
            vec![Action::Token("found three sources")],
            vec![Action::Token("here is the summary")],
        ],
        vec![],
    );
    let runner = runner_for(client.clone(), config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "research rust runtimes"))).await;

    // Output after the commit point is discarded.
    assert!(!tokens(&events).contains("MUST NOT APPEAR"));

    let created = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::PlanCreated { plan } => Some(plan.clone()),
            _ => None,
        })
        .expect("plan-created missing");
    assert_eq!(created.steps.len(), 2);
    assert!(created.steps.iter().all(|s| s.status == StepStatus::Pending));

    assert_eq!(
        step_updates(&events),
        vec![
            (1, StepStatus::Running),
            (1, StepStatus::Completed),
            (2, StepStatus::Running),
            (2, StepStatus::Completed),
        ]
    );
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));

    // One direct loop, two executor loops, no evaluator call.
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 3);
    assert_eq!(client.structured_calls.load(Ordering::SeqCst), 0);
}

struct RejectAll;

#[async_trait]
impl ApprovalSource for RejectAll {
    async fn wait_decision(&self, _plan_id: &str) -> Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn rejected_approval_skips_the_plan_stage() {
    let mut config = EngineConfig::default();
    config.plan_require_approval = true;
    let config = Arc::new(config);

    let client = ScriptedClient::new(
        vec![vec![Action::CallTool {
            tool: "plan_create",
            input: json!({ "title": "t", "steps": ["a", "b"] }),
        }]],
        vec![],
    );
    let runner = runner_for(client.clone(), config.clone(), Arc::new(RejectAll));

    let events = collect(runner.run(context(&config, "do the thing"))).await;

    assert!(kinds(&events).contains(&"plan-approval-request"));
    assert!(tokens(&events).contains("declined"));
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    assert!(step_updates(&events).is_empty());
    // Only the direct loop ran.
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn revise_replaces_remaining_steps_and_runs_exactly_two_more() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(
        vec![
            vec![Action::CallTool {
                tool: "plan_create",
                input: json!({ "title": "t", "steps": ["a1", "a2", "a3"] }),
            }],
            // Step 1 finishes but its response carries the error marker, so
            // the evaluator is consulted.
            vec![Action::Token("[ERROR] source unavailable, pivoting")],
            vec![Action::Token("b2 done")],
            vec![Action::Token("b3 done")],
        ],
        vec![r#"{"action":"revise","revised_steps":["b2","b3"],"reason":"source gone"}"#],
    );
    let runner = runner_for(client.clone(), config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "multi step"))).await;

    let revised = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::PlanRevised {
                revised_steps,
                keep_completed,
                reason,
                ..
            } => Some((revised_steps.clone(), *keep_completed, reason.clone())),
            _ => None,
        })
        .expect("plan-revised missing");
    assert_eq!(
        revised,
        (vec!["b2".to_string(), "b3".to_string()], 1, "source gone".to_string())
    );

    // Step 1, then exactly two post-revision steps.
    assert_eq!(
        step_updates(&events),
        vec![
            (1, StepStatus::Running),
            (1, StepStatus::Completed),
            (2, StepStatus::Running),
            (2, StepStatus::Completed),
            (3, StepStatus::Running),
            (3, StepStatus::Completed),
        ]
    );
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 4);
    assert_eq!(client.structured_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_revise_keeps_the_current_plan() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(
        vec![
            vec![Action::CallTool {
                tool: "plan_create",
                input: json!({ "title": "t", "steps": ["a1", "a2", "a3"] }),
            }],
            vec![Action::Token("[ERROR] flaky but done")],
            vec![Action::Token("a2 done")],
            vec![Action::Token("a3 done")],
        ],
        vec![r#"{"action":"revise","revised_steps":[],"reason":"nothing to change"}"#],
    );
    let runner = runner_for(client.clone(), config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "multi step"))).await;

    // The empty revise is ignored; all three original steps still execute.
    assert!(!kinds(&events).contains(&"plan-revised"));
    assert_eq!(
        step_updates(&events),
        vec![
            (1, StepStatus::Running),
            (1, StepStatus::Completed),
            (2, StepStatus::Running),
            (2, StepStatus::Completed),
            (3, StepStatus::Running),
            (3, StepStatus::Completed),
        ]
    );
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 4);
    assert_eq!(client.structured_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn finish_completes_remaining_steps_and_emits_the_response() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(
        vec![
            vec![Action::CallTool {
                tool: "plan_create",
                input: json!({ "title": "t", "steps": ["a1", "a2", "a3"] }),
            }],
            vec![Action::Token("[ERROR] partial, but the goal is met")],
        ],
        vec![r#"{"action":"finish","response":"All set.","reason":"goal met after step 1"}"#],
    );
    let runner = runner_for(client.clone(), config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "multi step"))).await;

    // Steps 2 and 3 are never executed; they flip straight to completed.
    assert_eq!(
        step_updates(&events),
        vec![
            (1, StepStatus::Running),
            (1, StepStatus::Completed),
            (2, StepStatus::Completed),
            (3, StepStatus::Completed),
        ]
    );
    assert!(tokens(&events).contains("All set."));
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 2);
    assert_eq!(client.structured_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn step_cap_ends_the_stage_without_executing_the_rest() {
    // A revision can grow the plan past `plan_max_steps`; execution still
    // stops at the cap, leaving the overflow step pending.
    let mut config = EngineConfig::default();
    config.plan_max_steps = 3;
    let config = Arc::new(config);

    let client = ScriptedClient::new(
        vec![
            vec![Action::CallTool {
                tool: "plan_create",
                input: json!({ "title": "t", "steps": ["a1", "a2", "a3"] }),
            }],
            vec![Action::Token("[ERROR] pivoting")],
            vec![Action::Token("b2 done")],
            vec![Action::Token("b3 done")],
        ],
        vec![r#"{"action":"revise","revised_steps":["b2","b3","b4"],"reason":"more work"}"#],
    );
    let runner = runner_for(client.clone(), config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "multi step"))).await;

    assert!(kinds(&events).contains(&"plan-revised"));
    // Step 4 (b4) is past the cap: no running transition for it.
    assert_eq!(
        step_updates(&events),
        vec![
            (1, StepStatus::Running),
            (1, StepStatus::Completed),
            (2, StepStatus::Running),
            (2, StepStatus::Completed),
            (3, StepStatus::Running),
            (3, StepStatus::Completed),
        ]
    );
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    // Direct loop plus three executed steps.
    assert_eq!(client.loops_started.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn loop_failure_ends_with_a_single_error() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(
        vec![vec![Action::Token("partial"), Action::Fail("provider exploded")]],
        vec![],
    );
    let runner = runner_for(client, config.clone(), Arc::new(AutoApprove));

    let events = collect(runner.run(context(&config, "hi"))).await;

    match events.last() {
        Some(AgentEvent::Error { content }) => assert!(content.contains("provider exploded")),
        other => panic!("expected terminal error, got {other:?}"),
    }
    assert_eq!(
        kinds(&events).iter().filter(|k| **k == "error").count(),
        1
    );
    assert!(!kinds(&events).contains(&"done"));
}

#[tokio::test]
async fn cancellation_emits_error_then_done() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(
        vec![vec![Action::Token("working on it"), Action::Hang]],
        vec![],
    );
    let runner = runner_for(client, config.clone(), Arc::new(AutoApprove));

    let cancel = CancellationToken::new();
    let ctx = context(&config, "hi").with_cancellation(cancel.clone());
    let mut rx = runner.run(ctx);

    // Cancel once the first token proves the loop is underway.
    let first = rx.recv().await.expect("stream ended early");
    assert_eq!(first.kind(), "token");
    cancel.cancel();

    let mut rest = collect(rx).await;
    let done = rest.pop().expect("missing terminal event");
    let error = rest.pop().expect("missing error before done");
    assert_eq!(done.kind(), "done");
    assert_eq!(error.kind(), "error");
}

// ---------------------------------------------------------------------------
// Middleware lifecycle
// ---------------------------------------------------------------------------

struct Recording {
    starts: AtomicUsize,
    ends: AtomicUsize,
    last_outcome: Mutex<Option<RunOutcome>>,
    swallow_tokens: bool,
}

impl Recording {
    fn new(swallow_tokens: bool) -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
            last_outcome: Mutex::new(None),
            swallow_tokens,
        })
    }
}

#[async_trait]
impl Middleware for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_run_start(&self, _ctx: &RunContext) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_event(&self, event: AgentEvent, _ctx: &RunContext) -> Result<Option<AgentEvent>> {
        if self.swallow_tokens && matches!(event, AgentEvent::Token { .. }) {
            return Ok(None);
        }
        Ok(Some(event))
    }

    async fn on_run_end(&self, _ctx: &RunContext, outcome: &RunOutcome) -> Result<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        *self.last_outcome.lock().unwrap() = Some(outcome.clone());
        Ok(())
    }
}

#[tokio::test]
async fn middleware_can_suppress_events_but_not_the_terminal() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(vec![vec![Action::Token("secret")]], vec![]);
    let recording = Recording::new(true);
    let runner = runner_for(client, config.clone(), Arc::new(AutoApprove))
        .with_middleware(recording.clone());

    let events = collect(runner.run(context(&config, "hi"))).await;

    assert!(tokens(&events).is_empty());
    assert_eq!(events.last().map(AgentEvent::kind), Some("done"));
    assert_eq!(recording.starts.load(Ordering::SeqCst), 1);
    assert_eq!(recording.ends.load(Ordering::SeqCst), 1);
    assert_eq!(
        *recording.last_outcome.lock().unwrap(),
        Some(RunOutcome::Completed)
    );
}

struct FailingObserver;

#[async_trait]
impl Middleware for FailingObserver {
    fn name(&self) -> &str {
        "failing"
    }
    async fn on_event(&self, _event: AgentEvent, _ctx: &RunContext) -> Result<Option<AgentEvent>> {
        Err(EngineError::Internal("observer broke".into()))
    }
}

#[tokio::test]
async fn failing_observer_aborts_the_run_and_run_end_still_fires() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(vec![vec![Action::Token("hello")]], vec![]);
    let recording = Recording::new(false);
    let runner = runner_for(client, config.clone(), Arc::new(AutoApprove))
        .with_middleware(Arc::new(FailingObserver))
        .with_middleware(recording.clone());

    let events = collect(runner.run(context(&config, "hi"))).await;

    match events.last() {
        Some(AgentEvent::Error { content }) => assert!(content.contains("failing")),
        other => panic!("expected terminal error, got {other:?}"),
    }
    assert_eq!(recording.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_end_fires_once_on_failure_too() {
    let config = Arc::new(EngineConfig::default());
    let client = ScriptedClient::new(vec![vec![Action::Fail("boom")]], vec![]);
    let recording = Recording::new(false);
    let runner = runner_for(client, config.clone(), Arc::new(AutoApprove))
        .with_middleware(recording.clone());

    let events = collect(runner.run(context(&config, "hi"))).await;

    assert_eq!(events.last().map(AgentEvent::kind), Some("error"));
    assert_eq!(recording.ends.load(Ordering::SeqCst), 1);
    assert!(matches!(
        *recording.last_outcome.lock().unwrap(),
        Some(RunOutcome::Failed { .. })
    ));
}
