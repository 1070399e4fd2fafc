//! Tool abstraction and the built-in plan tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::ToolDefinition;
use crate::plan::{PlanState, StepStatus};

/// Prefix a tool result carries when it was served from a result cache
/// rather than a live invocation.  The adapter strips it before emitting
/// the `tool-end` event and sets the `cached` flag instead.
pub const CACHE_HIT_PREFIX: &str = "[CACHE_HIT]";

/// A capability the model can invoke during a reasoning loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Schema advertised to the model.
    fn definition(&self) -> ToolDefinition;

    async fn invoke(&self, input: Value, ctx: &RunContext) -> Result<String>;
}

/// The tool sets offered to the two stages.
///
/// The direct stage sees every registered tool.  Plan-stage executors see a
/// restricted set with `plan_create` removed and `plan_update` added, so a
/// step cannot commit a second plan but can report its own progress.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Full tool set plus `plan_create`, for the direct stage.
    pub fn direct_set(&self) -> Vec<Arc<dyn Tool>> {
        let mut set = self.tools.clone();
        if self.get(PlanCreateTool::NAME).is_none() {
            set.push(Arc::new(PlanCreateTool));
        }
        set
    }

    /// Restricted set for plan-stage executors: no `plan_create`, with
    /// `plan_update` available.
    pub fn executor_set(&self) -> Vec<Arc<dyn Tool>> {
        let mut set: Vec<Arc<dyn Tool>> = self
            .tools
            .iter()
            .filter(|t| t.name() != PlanCreateTool::NAME)
            .cloned()
            .collect();
        if self.get(PlanUpdateTool::NAME).is_none() {
            set.push(Arc::new(PlanUpdateTool));
        }
        set
    }
}

// ---------------------------------------------------------------------------
// plan_create
// ---------------------------------------------------------------------------

/// Commits a multi-step plan for the current request.
///
/// Invoking this tool is the commit point that ends the direct stage.
pub struct PlanCreateTool;

impl PlanCreateTool {
    pub const NAME: &'static str = "plan_create";
}

#[async_trait]
impl Tool for PlanCreateTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Commit a multi-step plan for a task too complex to answer directly. \
                          Use only when the task genuinely needs several distinct steps."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Short plan title" },
                    "steps": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Ordered step descriptions"
                    }
                },
                "required": ["title", "steps"]
            }),
        }
    }

    async fn invoke(&self, input: Value, ctx: &RunContext) -> Result<String> {
        if ctx.has_plan() {
            return Ok("A plan already exists for this request; continuing with it.".to_string());
        }

        let title = input
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Plan")
            .trim()
            .to_string();
        let steps = normalize_steps(input.get("steps"))?;
        if steps.is_empty() {
            return Err(EngineError::ToolFailed {
                tool: Self::NAME.to_string(),
                reason: "plan requires at least one step".to_string(),
            });
        }
        let max_steps = ctx.config.plan_max_steps;
        if steps.len() > max_steps {
            return Err(EngineError::ToolFailed {
                tool: Self::NAME.to_string(),
                reason: format!("plan has {} steps, limit is {max_steps}", steps.len()),
            });
        }

        let plan = PlanState::new(title, steps);
        let plan_id = plan.plan_id.clone();
        let count = plan.steps.len();
        ctx.commit_plan(plan)?;
        Ok(format!("Plan {plan_id} created with {count} steps."))
    }
}

/// Accept step entries as plain strings or objects carrying a title field.
fn normalize_steps(raw: Option<&Value>) -> Result<Vec<String>> {
    let Some(Value::Array(items)) = raw else {
        return Err(EngineError::ToolFailed {
            tool: PlanCreateTool::NAME.to_string(),
            reason: "steps must be an array".to_string(),
        });
    };
    let mut steps = Vec::with_capacity(items.len());
    for item in items {
        let title = match item {
            Value::String(s) => s.trim().to_string(),
            Value::Object(map) => map
                .get("title")
                .or_else(|| map.get("description"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            _ => String::new(),
        };
        if !title.is_empty() {
            steps.push(title);
        }
    }
    Ok(steps)
}

// ---------------------------------------------------------------------------
// plan_update
// ---------------------------------------------------------------------------

/// Lets a plan-stage executor report progress on its own step.
pub struct PlanUpdateTool;

impl PlanUpdateTool {
    pub const NAME: &'static str = "plan_update";
}

#[async_trait]
impl Tool for PlanUpdateTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Update the status of a plan step.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "step_id": { "type": "integer", "description": "1-based step id" },
                    "status": {
                        "type": "string",
                        "enum": ["running", "completed", "failed"]
                    }
                },
                "required": ["step_id", "status"]
            }),
        }
    }

    async fn invoke(&self, input: Value, ctx: &RunContext) -> Result<String> {
        let step_id = input
            .get("step_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::ToolFailed {
                tool: Self::NAME.to_string(),
                reason: "step_id must be a positive integer".to_string(),
            })? as u32;
        let status_raw = input
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let status = StepStatus::parse(status_raw).ok_or_else(|| EngineError::ToolFailed {
            tool: Self::NAME.to_string(),
            reason: format!("unknown status {status_raw:?}"),
        })?;
        ctx.update_plan_step(step_id, status)?;
        Ok(format!("Step {step_id} -> {}", status.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
