//! Top-level run orchestration.
//!
//! The runner sequences one request end to end: lifecycle hooks, the direct
//! stage, the optional approval gate and plan stage, and the terminal event.
//! It owns the outward bounded channel; callers consume the receiver and
//! frame events however their transport requires.
//!
//! Terminal guarantees: every run's stream ends with `done` or `error`.  A
//! failed run ends with a single `error`.  A cancelled run emits `error`
//! then `done`.  Terminal events bypass the middleware chain.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::approval::ApprovalSource;
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::event::AgentEvent;
use crate::middleware::{Middleware, RunOutcome};
use crate::model::cache::ModelCache;
use crate::stage::{self, EventPipe, StageKind};
use crate::tool::ToolRegistry;

/// Outward channel depth.  Small enough to exert backpressure on the model
/// loop when the consumer stalls.
const OUT_CHANNEL_CAPACITY: usize = 64;

/// Sequences stages and middleware for each request.
pub struct Runner {
    cache: Arc<ModelCache>,
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalSource>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Runner {
    pub fn new(
        cache: Arc<ModelCache>,
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalSource>,
    ) -> Self {
        Self {
            cache,
            registry,
            approval,
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware.  Chain order is registration order.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Start one run and return its event stream.
    ///
    /// The caller populates `ctx.message` and `ctx.session_history` before
    /// calling.  The run executes on its own task; dropping the receiver
    /// ends the run at its next delivery attempt.
    pub fn run(&self, ctx: RunContext) -> mpsc::Receiver<AgentEvent> {
        let (out_tx, out_rx) = mpsc::channel(OUT_CHANNEL_CAPACITY);
        let ctx = Arc::new(ctx);
        let cache = Arc::clone(&self.cache);
        let registry = Arc::clone(&self.registry);
        let approval = Arc::clone(&self.approval);
        let middlewares = self.middlewares.clone();

        tokio::spawn(async move {
            execute(cache, registry, approval, middlewares, ctx, out_tx).await;
        });
        out_rx
    }
}

async fn execute(
    cache: Arc<ModelCache>,
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalSource>,
    middlewares: Vec<Arc<dyn Middleware>>,
    ctx: Arc<RunContext>,
    out_tx: mpsc::Sender<AgentEvent>,
) {
    let pipe = EventPipe::new(&out_tx, &middlewares, &ctx);

    let result = match start_hooks(&middlewares, &ctx).await {
        Ok(()) => drive(&cache, &registry, approval.as_ref(), &ctx, &pipe).await,
        Err(e) => Err(e),
    };

    // Late side-channel events still belong to this run's stream.
    if let Err(e) = pipe.drain().await {
        tracing::debug!(session_id = %ctx.session_id, error = %e, "final drain failed");
    }

    let outcome = match &result {
        Ok(()) => RunOutcome::Completed,
        Err(EngineError::Cancelled) => RunOutcome::Cancelled,
        Err(e) => RunOutcome::Failed {
            reason: e.to_string(),
        },
    };
    match &outcome {
        RunOutcome::Completed => {
            let _ = pipe.send_terminal(AgentEvent::Done).await;
        }
        RunOutcome::Cancelled => {
            tracing::info!(session_id = %ctx.session_id, "run cancelled");
            let _ = pipe.send_terminal(AgentEvent::error("run cancelled")).await;
            let _ = pipe.send_terminal(AgentEvent::Done).await;
        }
        RunOutcome::Failed { reason } => {
            tracing::error!(session_id = %ctx.session_id, %reason, "run failed");
            let _ = pipe.send_terminal(AgentEvent::error(reason)).await;
        }
    }

    end_hooks(&middlewares, &ctx, &outcome).await;
}

/// Explicit two-stage dispatch.
async fn drive(
    cache: &ModelCache,
    registry: &ToolRegistry,
    approval: &dyn ApprovalSource,
    ctx: &Arc<RunContext>,
    pipe: &EventPipe<'_>,
) -> Result<()> {
    let mut stage = StageKind::Direct;
    loop {
        match stage {
            StageKind::Direct => {
                stage::direct::run(cache, registry, ctx, pipe).await?;
                pipe.drain().await?;
                if !ctx.has_plan() {
                    return Ok(());
                }
                stage = StageKind::Plan;
            }
            StageKind::Plan => {
                if ctx.config.plan_require_approval && !gate(approval, ctx, pipe).await? {
                    return Ok(());
                }
                stage::plan::run(cache, registry, ctx, pipe).await?;
                pipe.drain().await?;
                return Ok(());
            }
        }
    }
}

/// Emit the approval request and suspend until a decision or cancellation.
///
/// Returns whether the plan was approved.  On rejection the terminal
/// response is forwarded here; the caller just ends the run.
async fn gate(
    approval: &dyn ApprovalSource,
    ctx: &Arc<RunContext>,
    pipe: &EventPipe<'_>,
) -> Result<bool> {
    let plan = ctx
        .plan_snapshot()
        .ok_or_else(|| EngineError::Internal("approval gate without a plan".into()))?;
    ctx.emit_side_channel(AgentEvent::PlanApprovalRequest {
        plan_id: plan.plan_id.clone(),
        title: plan.title.clone(),
        steps: plan.steps.clone(),
    });
    pipe.drain().await?;

    tracing::info!(session_id = %ctx.session_id, plan_id = %plan.plan_id, "awaiting plan approval");
    let approved = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
        decision = approval.wait_decision(&plan.plan_id) => decision?,
    };
    if !approved {
        tracing::info!(session_id = %ctx.session_id, plan_id = %plan.plan_id, "plan rejected");
        pipe.forward(AgentEvent::token(
            "The proposed plan was declined, so it will not be executed. \
             Let me know how you would like to proceed instead.",
        ))
        .await?;
    }
    Ok(approved)
}

async fn start_hooks(middlewares: &[Arc<dyn Middleware>], ctx: &RunContext) -> Result<()> {
    for mw in middlewares {
        mw.on_run_start(ctx)
            .await
            .map_err(|e| EngineError::MiddlewareFailed {
                name: mw.name().to_string(),
                hook: "on_run_start",
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

/// Run `on_run_end` for every middleware exactly once.  Hook failures are
/// logged; by this point the terminal event is already on the wire.
async fn end_hooks(middlewares: &[Arc<dyn Middleware>], ctx: &RunContext, outcome: &RunOutcome) {
    for mw in middlewares {
        if let Err(e) = mw.on_run_end(ctx, outcome).await {
            tracing::warn!(
                session_id = %ctx.session_id,
                middleware = mw.name(),
                error = %e,
                "on_run_end failed"
            );
        }
    }
}
