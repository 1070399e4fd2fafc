//! Standardized agent events and their wire encoding.
//!
//! Every observable moment of a run (token deltas, tool and model call
//! boundaries, plan lifecycle, termination) is one [`AgentEvent`].  Events
//! are immutable once constructed; the observation pipeline replaces events
//! with new ones rather than mutating in place.
//!
//! The wire encoding is a single `data: <json>` SSE frame per event.
//! Optional fields are omitted rather than encoded as null.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plan::{PlanState, PlanStep, StepStatus};

/// One standardized event on the run's outward stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    /// A streamed text delta from the model, verbatim.
    Token { content: String },

    /// A tool invocation has started.
    ToolStart {
        tool: String,
        input: String,
        motivation: String,
    },

    /// A tool invocation has finished (successfully or with error content).
    ToolEnd {
        tool: String,
        output: String,
        /// Whether the result was served from a cache.
        cached: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// A model call has started.
    ModelCallStart {
        call_id: String,
        /// Caller-supplied node label ("direct" for the first stage,
        /// "executor" for per-step loops).
        node: String,
        model: String,
        input: String,
        motivation: String,
    },

    /// A model call has finished.
    ModelCallEnd {
        call_id: String,
        node: String,
        model: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u32>,
        input: String,
        output: String,
    },

    /// Terminal: the run completed.
    Done,

    /// Terminal (or pre-`done` on cancellation): the run failed.
    Error { content: String },

    /// A plan was committed by the direct stage.
    PlanCreated { plan: PlanState },

    /// One step changed status.
    PlanUpdated {
        plan_id: String,
        step_id: u32,
        status: StepStatus,
    },

    /// The evaluator replaced the remaining steps.
    PlanRevised {
        plan_id: String,
        revised_steps: Vec<String>,
        keep_completed: usize,
        reason: String,
    },

    /// The run is suspended awaiting human approval of the plan.
    PlanApprovalRequest {
        plan_id: String,
        title: String,
        steps: Vec<PlanStep>,
    },
}

impl AgentEvent {
    /// Build a token event.
    pub fn token(content: impl Into<String>) -> Self {
        AgentEvent::Token {
            content: content.into(),
        }
    }

    /// Build a tool-start event.
    pub fn tool_start(
        tool: impl Into<String>,
        input: impl Into<String>,
        motivation: impl Into<String>,
    ) -> Self {
        AgentEvent::ToolStart {
            tool: tool.into(),
            input: input.into(),
            motivation: motivation.into(),
        }
    }

    /// Build a tool-end event.
    pub fn tool_end(
        tool: impl Into<String>,
        output: impl Into<String>,
        cached: bool,
        duration_ms: Option<u64>,
    ) -> Self {
        AgentEvent::ToolEnd {
            tool: tool.into(),
            output: output.into(),
            cached,
            duration_ms,
        }
    }

    /// Build an error event.
    pub fn error(content: impl Into<String>) -> Self {
        AgentEvent::Error {
            content: content.into(),
        }
    }

    /// Build a plan-updated event.
    pub fn plan_updated(plan_id: impl Into<String>, step_id: u32, status: StepStatus) -> Self {
        AgentEvent::PlanUpdated {
            plan_id: plan_id.into(),
            step_id,
            status,
        }
    }

    /// Wire tag for this event, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Token { .. } => "token",
            AgentEvent::ToolStart { .. } => "tool-start",
            AgentEvent::ToolEnd { .. } => "tool-end",
            AgentEvent::ModelCallStart { .. } => "model-call-start",
            AgentEvent::ModelCallEnd { .. } => "model-call-end",
            AgentEvent::Done => "done",
            AgentEvent::Error { .. } => "error",
            AgentEvent::PlanCreated { .. } => "plan-created",
            AgentEvent::PlanUpdated { .. } => "plan-updated",
            AgentEvent::PlanRevised { .. } => "plan-revised",
            AgentEvent::PlanApprovalRequest { .. } => "plan-approval-request",
        }
    }

    /// Whether this event travels on the side channel (plan/approval events)
    /// rather than the primary channel.
    pub fn is_side_channel(&self) -> bool {
        matches!(
            self,
            AgentEvent::PlanCreated { .. }
                | AgentEvent::PlanUpdated { .. }
                | AgentEvent::PlanRevised { .. }
                | AgentEvent::PlanApprovalRequest { .. }
        )
    }

    /// Whether this event terminates the primary channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done | AgentEvent::Error { .. })
    }
}

/// Serialize one event as a single SSE frame: `data: <json>\n\n`.
///
/// Deterministic for a given event value; optional fields are omitted.
pub fn serialize_sse(event: &AgentEvent) -> Result<String> {
    let json = serde_json::to_string(event)?;
    Ok(format!("data: {json}\n\n"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
