//! Plan stage: step-by-step execution of a committed plan.
//!
//! Each pending step gets its own restricted-tool reasoning loop.  After a
//! step finishes, a textual heuristic decides whether to consult the
//! replanning evaluator: a step whose response carries no error marker is
//! treated as on-track and the plan continues unchanged.  The heuristic is
//! known to be imprecise when tool output legitimately contains the marker
//! text, and is kept as-is for compatibility with existing behavior.

use std::sync::Arc;

use crate::adapter::EventStream;
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::event::AgentEvent;
use crate::model::cache::ModelCache;
use crate::model::{LoopRequest, Message, ModelClient, ModelResolver};
use crate::plan::{PlanState, PlanStep, ReplanDecision, StepStatus};
use crate::stage::{EventPipe, replan};
use crate::tool::ToolRegistry;

/// Marker a failed step's response carries; also what the heuristic scans
/// for when deciding whether to consult the evaluator.
const ERROR_MARKER: &str = "[ERROR]";

/// Prior-step summary length inside an executor prompt.
const PRIOR_STEP_LIMIT: usize = 1000;

/// Stored step-response length for the evaluator's history.
const HISTORY_LIMIT: usize = 1000;

const EXECUTOR_SYSTEM_PROMPT: &str = "\
You are executing one step of a multi-step plan. Focus only on the current \
step; do not attempt later steps. Use the available tools as needed and \
finish with a concise result for this step.";

/// Run the plan stage over the context's committed plan.
pub async fn run(
    cache: &ModelCache,
    registry: &ToolRegistry,
    ctx: &Arc<RunContext>,
    pipe: &EventPipe<'_>,
) -> Result<()> {
    let mut plan = ctx
        .plan_snapshot()
        .ok_or_else(|| EngineError::Internal("plan stage started without a plan".into()))?;

    let config = ctx.config.resolve("executor")?;
    let executor = cache.get_instance("executor", true)?;
    let evaluator = cache.get_instance("replan", false)?;
    let tools = registry.executor_set();

    // (title, truncated response) per finished step, oldest first.
    let mut past_steps: Vec<(String, String)> = Vec::new();
    let mut executed = 0usize;
    let step_cap = ctx.config.plan_max_steps;

    while let Some(step) = next_pending(&plan) {
        // Step cap is not an error: remaining steps are simply not executed.
        if executed >= step_cap {
            tracing::warn!(
                session_id = %ctx.session_id,
                plan_id = %plan.plan_id,
                executed,
                "step cap reached; ending plan stage"
            );
            break;
        }
        executed += 1;

        ctx.update_plan_step(step.id, StepStatus::Running)?;
        pipe.drain().await?;

        let outcome = execute_step(
            &executor, &config.model, &tools, ctx, pipe, &plan, &step, &past_steps,
        )
        .await;
        let response = match outcome {
            Ok(response) => {
                // The step may have completed itself through plan_update.
                if ctx
                    .plan_snapshot()
                    .and_then(|p| p.step(step.id).map(|s| s.status))
                    == Some(StepStatus::Running)
                {
                    ctx.update_plan_step(step.id, StepStatus::Completed)?;
                }
                response
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    step_id = step.id,
                    error = %e,
                    "plan step failed"
                );
                ctx.update_plan_step(step.id, StepStatus::Failed)?;
                pipe.forward(AgentEvent::token(format!("\n> Step {} failed: {e}\n", step.id)))
                    .await?;
                format!("{ERROR_MARKER} {e}")
            }
        };
        pipe.drain().await?;
        past_steps.push((step.title.clone(), head(&response, HISTORY_LIMIT).to_string()));

        plan = ctx
            .plan_snapshot()
            .ok_or_else(|| EngineError::Internal("plan vanished mid-stage".into()))?;
        let remaining: Vec<String> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.title.clone())
            .collect();
        if remaining.is_empty() {
            break;
        }

        // Consult the evaluator only when more than one step remains and the
        // step's response carries the error marker; everything else is an
        // implicit continue.
        let consult = ctx.config.plan_revision_enabled
            && remaining.len() > 1
            && response.contains(ERROR_MARKER);
        if !consult {
            continue;
        }

        let decision = replan::evaluate(&evaluator, ctx, &plan.title, &past_steps, &remaining)
            .await?
            .unwrap_or(ReplanDecision::Continue {
                reason: "evaluation unavailable".to_string(),
            });
        match decision {
            ReplanDecision::Continue { reason } => {
                tracing::debug!(session_id = %ctx.session_id, %reason, "continuing plan");
            }
            ReplanDecision::Finish { response, reason } => {
                tracing::info!(session_id = %ctx.session_id, %reason, "finishing plan early");
                ctx.complete_remaining_steps()?;
                pipe.drain().await?;
                if !response.is_empty() {
                    pipe.forward(AgentEvent::token(format!("\n\n{response}"))).await?;
                }
                break;
            }
            ReplanDecision::Revise {
                revised_steps,
                reason,
            } => {
                // A revise with no replacement steps would truncate the plan
                // to its completed prefix; treat it as continue instead.
                if revised_steps.is_empty() {
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        %reason,
                        "revise decision carried no steps; keeping current plan"
                    );
                    continue;
                }
                let keep_completed = plan
                    .steps
                    .iter()
                    .filter(|s| {
                        matches!(s.status, StepStatus::Completed | StepStatus::Failed)
                    })
                    .count();
                plan = ctx.revise_plan(keep_completed, &revised_steps, &reason)?;
                pipe.drain().await?;
            }
        }
    }
    Ok(())
}

fn next_pending(plan: &PlanState) -> Option<PlanStep> {
    plan.steps
        .iter()
        .find(|s| s.status == StepStatus::Pending)
        .cloned()
}

/// Run one step's reasoning loop, forwarding every event, and return the
/// concatenation of its token content.
#[allow(clippy::too_many_arguments)]
async fn execute_step(
    client: &Arc<dyn ModelClient>,
    model: &str,
    tools: &[Arc<dyn crate::tool::Tool>],
    ctx: &Arc<RunContext>,
    pipe: &EventPipe<'_>,
    plan: &PlanState,
    step: &PlanStep,
    past_steps: &[(String, String)],
) -> Result<String> {
    let position = plan
        .steps
        .iter()
        .position(|s| s.id == step.id)
        .unwrap_or_default();
    let instruction = step_instruction(plan, step, position, past_steps);

    let request = LoopRequest {
        system_prompt: EXECUTOR_SYSTEM_PROMPT.to_string(),
        history: vec![Message::user(&instruction)],
        tools: tools.to_vec(),
        recursion_limit: ctx.config.executor_recursion_limit,
    };
    let raw = client.start_loop(request, Arc::clone(ctx)).await?;
    let prompt_prefix = format!("{EXECUTOR_SYSTEM_PROMPT}\n\n{instruction}");
    let mut stream = EventStream::new(
        raw,
        "executor",
        model,
        format!("Execute step {}: {}", step.id, step.title),
        prompt_prefix,
        ctx.cancel.clone(),
    );

    let mut response = String::new();
    while let Some(event) = stream.next().await {
        let event = event?;
        if let AgentEvent::Token { content } = &event {
            response.push_str(content);
        }
        pipe.forward(event).await?;
    }
    Ok(response)
}

fn step_instruction(
    plan: &PlanState,
    step: &PlanStep,
    position: usize,
    past_steps: &[(String, String)],
) -> String {
    let mut prompt = format!(
        "Plan: {}\nCurrent step ({position} of {}): {}\n",
        plan.title,
        plan.steps.len(),
        step.title,
    );
    if !past_steps.is_empty() {
        prompt.push_str("\nPrior steps:\n");
        for (title, response) in past_steps {
            prompt.push_str(&format!("- {title}: {}\n", head(response, PRIOR_STEP_LIMIT)));
        }
    }
    prompt.push_str("\nCarry out the current step now.");
    prompt
}

fn head(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
