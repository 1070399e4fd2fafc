//! Replanning evaluator.
//!
//! After a plan step finishes, the evaluator asks a structured-output model
//! call whether to continue, finish early, or revise the remaining steps.
//! The evaluator fails open: a failed call or an undecodable reply degrades
//! to "continue" so a flaky evaluator can never strand a run.

use std::sync::Arc;

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::ModelClient;
use crate::plan::ReplanDecision;

/// Per-step summary fed to the evaluator prompt.
const PAST_STEP_LIMIT: usize = 200;

/// Decide what to do after a finished step.
///
/// `Ok(None)` means the evaluator call failed and the caller should proceed
/// as if it had said continue.  Only cancellation propagates as an error.
pub async fn evaluate(
    client: &Arc<dyn ModelClient>,
    ctx: &RunContext,
    goal: &str,
    past_steps: &[(String, String)],
    remaining: &[String],
) -> Result<Option<ReplanDecision>> {
    let prompt = build_prompt(goal, past_steps, remaining);
    let reply = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
        reply = client.complete_structured(&prompt, ReplanDecision::schema()) => reply,
    };
    match reply {
        Ok(raw) => Ok(Some(ReplanDecision::decode_or_continue(&raw))),
        Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
        Err(e) => {
            tracing::warn!(
                session_id = %ctx.session_id,
                error = %e,
                "replan evaluation failed; continuing with current plan"
            );
            Ok(None)
        }
    }
}

fn build_prompt(goal: &str, past_steps: &[(String, String)], remaining: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are reviewing the execution of a multi-step plan.\n\n");
    prompt.push_str(&format!("Goal: {goal}\n\nCompleted steps:\n"));
    for (title, response) in past_steps {
        prompt.push_str(&format!("- {title}: {}\n", head(response, PAST_STEP_LIMIT)));
    }
    prompt.push_str("\nRemaining steps:\n");
    for title in remaining {
        prompt.push_str(&format!("- {title}\n"));
    }
    prompt.push_str(
        "\nDecide the next action:\n\
         - \"continue\" if the remaining steps are still the right ones\n\
         - \"finish\" if the goal is already satisfied; include the final response\n\
         - \"revise\" if the remaining steps should change; include the replacement steps\n\
         Reply with a single JSON object matching the provided schema.",
    );
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
