//! Direct stage: one full-tool reasoning loop over the user message.
//!
//! The stage streams its loop to the consumer and watches for the plan
//! commit point.  The moment a `plan_create` tool call lands and the context
//! holds a committed plan, the stage stops forwarding and returns.  Any
//! trailing output the model produced after committing is discarded; the
//! plan stage owns the narrative from that point on.

use std::sync::Arc;

use crate::adapter::EventStream;
use crate::context::RunContext;
use crate::error::Result;
use crate::event::AgentEvent;
use crate::model::{LoopRequest, Message, ModelResolver};
use crate::model::cache::ModelCache;
use crate::stage::EventPipe;
use crate::tool::{PlanCreateTool, ToolRegistry};

const DIRECT_SYSTEM_PROMPT: &str = "\
You are a capable assistant. Answer the user directly when you can.\n\
For tasks that genuinely need several distinct steps, call plan_create with \
a short title and an ordered list of steps instead of answering directly. \
Do not create a plan for simple questions.";

/// Run the direct stage to completion or to the plan commit point.
///
/// Returns `Ok(())` in both cases; the caller checks `ctx.has_plan()` to
/// decide whether the plan stage follows.
pub async fn run(
    cache: &ModelCache,
    registry: &ToolRegistry,
    ctx: &Arc<RunContext>,
    pipe: &EventPipe<'_>,
) -> Result<()> {
    let config = ctx.config.resolve("direct")?;
    let client = cache.get_instance("direct", true)?;

    let mut history = ctx.session_history.clone();
    history.push(Message::user(&ctx.message));
    let request = LoopRequest {
        system_prompt: DIRECT_SYSTEM_PROMPT.to_string(),
        history,
        tools: registry.direct_set(),
        recursion_limit: ctx.config.recursion_limit,
    };

    tracing::debug!(session_id = %ctx.session_id, model = %config.model, "direct stage starting");
    let raw = client.start_loop(request, Arc::clone(ctx)).await?;
    let mut stream = EventStream::new(
        raw,
        "direct",
        &config.model,
        "Respond to the user",
        DIRECT_SYSTEM_PROMPT,
        ctx.cancel.clone(),
    );

    while let Some(event) = stream.next().await {
        let event = event?;
        let committed = matches!(
            &event,
            AgentEvent::ToolEnd { tool, .. } if tool == PlanCreateTool::NAME
        ) && ctx.has_plan();

        pipe.forward(event).await?;

        if committed {
            tracing::info!(session_id = %ctx.session_id, "plan committed; ending direct stage");
            return Ok(());
        }
    }
    Ok(())
}
