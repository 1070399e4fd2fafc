//! Plan data model.
//!
//! A plan is committed once per run by the direct stage (via the
//! `plan_create` tool) and then driven step by step by the plan stage.
//! Step status is monotonic: `pending -> running -> {completed | failed}`,
//! with `pending -> completed/failed` allowed for steps skipped by an early
//! finish.  All transition checking lives here so the stages and tools share
//! one rule.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Step status
// ---------------------------------------------------------------------------

/// Current execution state of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully (or skipped by an early finish).
    Completed,
    /// Failed during execution.
    Failed,
}

impl StepStatus {
    /// Whether a step may move from `self` to `to`.
    ///
    /// Terminal states accept nothing; `Pending` may jump straight to a
    /// terminal state when a step is skipped.
    pub fn can_transition_to(self, to: StepStatus) -> bool {
        matches!(
            (self, to),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Completed)
                | (StepStatus::Pending, StepStatus::Failed)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }

    /// Stable wire name, matching the serde encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    /// Parse a wire name back into a status.
    pub fn parse(s: &str) -> Option<StepStatus> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan state
// ---------------------------------------------------------------------------

/// A single step within a committed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based step id, stable for the lifetime of the step.
    pub id: u32,

    /// Human-readable step title.
    pub title: String,

    /// Current execution status.
    pub status: StepStatus,
}

/// The committed plan for one run.
///
/// Created by `plan_create`, mutated only through [`PlanState::mark_step`]
/// and [`PlanState::revise`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    /// Short hex plan identifier.
    pub plan_id: String,

    /// Plan title.
    pub title: String,

    /// Ordered steps.
    pub steps: Vec<PlanStep>,
}

impl PlanState {
    /// Create a plan with pending steps and 1-based ids.
    pub fn new(title: impl Into<String>, step_titles: Vec<String>) -> Self {
        let plan_id = Uuid::now_v7().simple().to_string()[..8].to_string();
        let steps = step_titles
            .into_iter()
            .enumerate()
            .map(|(i, title)| PlanStep {
                id: i as u32 + 1,
                title,
                status: StepStatus::Pending,
            })
            .collect();
        Self {
            plan_id,
            title: title.into(),
            steps,
        }
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Move one step to a new status, enforcing the monotonic rule.
    ///
    /// When `to` is [`StepStatus::Running`], every earlier step still pending
    /// or running is completed first.  Returns the `(step_id, status)`
    /// transitions applied, in order, so callers can emit one `plan-updated`
    /// event per transition.
    ///
    /// A rejected transition leaves the plan untouched: the target step is
    /// validated before any predecessor is completed.
    pub fn mark_step(&mut self, step_id: u32, to: StepStatus) -> Result<Vec<(u32, StepStatus)>> {
        let position = self
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or(EngineError::UnknownPlanStep { step_id })?;

        if !self.steps[position].status.can_transition_to(to) {
            return Err(EngineError::InvalidStepTransition {
                step_id,
                from: self.steps[position].status.as_str(),
                to: to.as_str(),
            });
        }

        let mut applied = Vec::new();

        if to == StepStatus::Running {
            for prior in &mut self.steps[..position] {
                if prior.status.can_transition_to(StepStatus::Completed) {
                    prior.status = StepStatus::Completed;
                    applied.push((prior.id, StepStatus::Completed));
                }
            }
        }

        self.steps[position].status = to;
        applied.push((step_id, to));
        Ok(applied)
    }

    /// Complete every step that has not reached a terminal state yet.
    ///
    /// Used when the evaluator decides the goal is already met.  Returns the
    /// transitions applied.
    pub fn complete_remaining(&mut self) -> Vec<(u32, StepStatus)> {
        let mut applied = Vec::new();
        for step in &mut self.steps {
            if step.status.can_transition_to(StepStatus::Completed) {
                step.status = StepStatus::Completed;
                applied.push((step.id, StepStatus::Completed));
            }
        }
        applied
    }

    /// Replace the suffix of steps from `keep_completed` onward with new
    /// pending steps.
    ///
    /// The first `keep_completed` steps are preserved untouched; replacement
    /// steps get ids continuing the original numbering.
    pub fn revise(&mut self, keep_completed: usize, new_titles: &[String]) {
        self.steps.truncate(keep_completed);
        for (i, title) in new_titles.iter().enumerate() {
            self.steps.push(PlanStep {
                id: keep_completed as u32 + i as u32 + 1,
                title: title.trim().to_string(),
                status: StepStatus::Pending,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Replan decision
// ---------------------------------------------------------------------------

/// Structured output of the replanning evaluator.
///
/// Produced once per evaluation from a single non-streaming model call and
/// never persisted.  Malformed output degrades to [`ReplanDecision::Continue`]
/// at the decode site; the evaluator is advisory and must not fail a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplanDecision {
    /// Remaining steps are still sensible; execute the next one.
    Continue {
        #[serde(default)]
        reason: String,
    },

    /// The goal is already met; remaining steps are skipped.
    Finish {
        /// Final textual response for the user, if any.
        #[serde(default)]
        response: String,
        #[serde(default)]
        reason: String,
    },

    /// Remaining steps should be replaced with `revised_steps`.
    Revise {
        revised_steps: Vec<String>,
        #[serde(default)]
        reason: String,
    },
}

impl ReplanDecision {
    /// Strict decode of evaluator output; any failure degrades to `Continue`.
    pub fn decode_or_continue(raw: &str) -> ReplanDecision {
        match serde_json::from_str::<ReplanDecision>(raw) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "replan decision malformed; continuing");
                ReplanDecision::Continue {
                    reason: String::new(),
                }
            }
        }
    }

    /// JSON schema the evaluator call is constrained to.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["continue", "finish", "revise"] },
                "response": { "type": "string" },
                "revised_steps": { "type": "array", "items": { "type": "string" } },
                "reason": { "type": "string" }
            },
            "required": ["action"]
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
