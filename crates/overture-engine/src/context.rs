//! Per-request run context.
//!
//! Exactly one [`RunContext`] exists per in-flight request.  It owns the
//! session identity, the conversation history, the committed plan state, two
//! unbounded side-channel queues (plan events, approval events), and the
//! run's cancellation handle.  It is never shared across requests and holds
//! no global mutable state; tools and stages reach configuration through
//! the context, not through ambient globals.
//!
//! Side-channel emission is thread-safe and non-blocking: any worker holding
//! the context can enqueue an event without touching the stream-producing
//! task, which drains the queues at documented checkpoints (before each
//! forwarded primary event and at stage boundaries).

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::AgentEvent;
use crate::model::Message;
use crate::plan::{PlanState, StepStatus};

/// Mutable per-request state container.
pub struct RunContext {
    /// Session this request belongs to.
    pub session_id: String,

    /// The current user message.  Set by the runner before the stages run.
    pub message: String,

    /// Conversation history, oldest first.  Immutable once loaded.
    pub session_history: Vec<Message>,

    /// Engine configuration for this request.
    pub config: Arc<EngineConfig>,

    /// Cancellation/deadline handle for the whole run.
    pub cancel: CancellationToken,

    /// Committed plan state; `None` until the direct stage commits a plan.
    plan: Mutex<Option<PlanState>>,

    plan_tx: mpsc::UnboundedSender<AgentEvent>,
    plan_rx: Mutex<mpsc::UnboundedReceiver<AgentEvent>>,
    approval_tx: mpsc::UnboundedSender<AgentEvent>,
    approval_rx: Mutex<mpsc::UnboundedReceiver<AgentEvent>>,
}

impl RunContext {
    /// Create a fresh context for one request.
    pub fn new(session_id: impl Into<String>, config: Arc<EngineConfig>) -> Self {
        let (plan_tx, plan_rx) = mpsc::unbounded_channel();
        let (approval_tx, approval_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            message: String::new(),
            session_history: Vec::new(),
            config,
            cancel: CancellationToken::new(),
            plan: Mutex::new(None),
            plan_tx,
            plan_rx: Mutex::new(plan_rx),
            approval_tx,
            approval_rx: Mutex::new(approval_rx),
        }
    }

    /// Replace the cancellation handle (callers that impose a deadline pass
    /// a child token here before starting the run).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    // -- Side channel --------------------------------------------------------

    /// Enqueue a plan/approval event for delivery on the outward stream.
    ///
    /// Safe to call from any worker; never blocks.  Approval requests go to
    /// the approval queue, all other plan events to the plan queue.
    pub fn emit_side_channel(&self, event: AgentEvent) {
        debug_assert!(event.is_side_channel());
        let tx = match event {
            AgentEvent::PlanApprovalRequest { .. } => &self.approval_tx,
            _ => &self.plan_tx,
        };
        if tx.send(event).is_err() {
            tracing::warn!(session_id = %self.session_id, "side channel closed; event dropped");
        }
    }

    /// Take every queued side-channel event, plan queue first.
    ///
    /// Called only by the stream-producing task at its checkpoints.
    pub fn drain_side_channels(&self) -> Vec<AgentEvent> {
        let mut drained = Vec::new();
        let mut plan_rx = self.plan_rx.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(event) = plan_rx.try_recv() {
            drained.push(event);
        }
        drop(plan_rx);
        let mut approval_rx = self
            .approval_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while let Ok(event) = approval_rx.try_recv() {
            drained.push(event);
        }
        drained
    }

    // -- Plan state ----------------------------------------------------------

    /// Whether a plan has been committed for this run.
    pub fn has_plan(&self) -> bool {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Clone the current plan state, if committed.
    pub fn plan_snapshot(&self) -> Option<PlanState> {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commit a plan.  Exactly one plan may be committed per run.
    ///
    /// Emits `plan-created` on the side channel.
    pub fn commit_plan(&self, plan: PlanState) -> Result<()> {
        let mut guard = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(EngineError::Internal(
                "a plan is already committed for this run".into(),
            ));
        }
        tracing::info!(
            session_id = %self.session_id,
            plan_id = %plan.plan_id,
            steps = plan.steps.len(),
            "plan committed"
        );
        self.emit_side_channel(AgentEvent::PlanCreated { plan: plan.clone() });
        *guard = Some(plan);
        Ok(())
    }

    /// Move one plan step to a new status and emit one `plan-updated` event
    /// per transition applied.
    pub fn update_plan_step(&self, step_id: u32, status: StepStatus) -> Result<()> {
        let mut guard = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = guard
            .as_mut()
            .ok_or_else(|| EngineError::Internal("no plan committed".into()))?;
        let plan_id = plan.plan_id.clone();
        let applied = plan.mark_step(step_id, status)?;
        drop(guard);

        for (step_id, status) in applied {
            self.emit_side_channel(AgentEvent::plan_updated(plan_id.clone(), step_id, status));
        }
        Ok(())
    }

    /// Complete every non-terminal plan step, emitting `plan-updated` events.
    pub fn complete_remaining_steps(&self) -> Result<()> {
        let mut guard = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = guard
            .as_mut()
            .ok_or_else(|| EngineError::Internal("no plan committed".into()))?;
        let plan_id = plan.plan_id.clone();
        let applied = plan.complete_remaining();
        drop(guard);

        for (step_id, status) in applied {
            self.emit_side_channel(AgentEvent::plan_updated(plan_id.clone(), step_id, status));
        }
        Ok(())
    }

    /// Replace the plan's remaining steps and emit one `plan-revised` event.
    ///
    /// Returns the revised snapshot so the caller can keep iterating on it.
    pub fn revise_plan(
        &self,
        keep_completed: usize,
        new_titles: &[String],
        reason: &str,
    ) -> Result<PlanState> {
        let mut guard = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = guard
            .as_mut()
            .ok_or_else(|| EngineError::Internal("no plan committed".into()))?;
        plan.revise(keep_completed, new_titles);
        let snapshot = plan.clone();
        drop(guard);

        tracing::info!(
            session_id = %self.session_id,
            plan_id = %snapshot.plan_id,
            keep_completed,
            new_steps = new_titles.len(),
            "plan revised"
        );
        self.emit_side_channel(AgentEvent::PlanRevised {
            plan_id: snapshot.plan_id.clone(),
            revised_steps: new_titles.to_vec(),
            keep_completed,
            reason: reason.to_string(),
        });
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
