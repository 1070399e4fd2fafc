//! Engine error types.
//!
//! All engine subsystems surface errors through [`EngineError`].  Each variant
//! carries enough context for the runner to decide whether the failure is
//! local (absorbed where it happened) or global (terminates the run).

/// Unified error type for the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Model errors --------------------------------------------------------
    /// A model call failed.  Global: terminates the run with an `error` event.
    #[error("model call failed: {reason}")]
    ModelCallFailed { reason: String },

    /// The model client could not be constructed from its configuration.
    #[error("model client construction failed: {reason}")]
    ClientBuildFailed { reason: String },

    /// No model configuration is registered for the requested scenario.
    #[error("no model configured for scenario: {scenario}")]
    NoModelConfigured { scenario: String },

    // -- Tool errors ---------------------------------------------------------
    /// A tool invocation failed.  Local: surfaced as error content on a
    /// normal `tool-end` event, never aborts the run.
    #[error("tool invocation failed for `{tool}`: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// A tool name referenced by the loop does not exist in the registry.
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    // -- Plan errors ---------------------------------------------------------
    /// A plan step status change violated the monotonic transition rule.
    #[error("invalid step transition for step {step_id}: {from} -> {to}")]
    InvalidStepTransition {
        step_id: u32,
        from: &'static str,
        to: &'static str,
    },

    /// A plan operation referenced a step id that does not exist.
    #[error("unknown plan step: {step_id}")]
    UnknownPlanStep { step_id: u32 },

    // -- Pipeline errors -----------------------------------------------------
    /// An observer hook failed.  Global: aborts the run (run-end hooks still
    /// fire for every observer).
    #[error("middleware `{name}` failed in {hook}: {reason}")]
    MiddlewareFailed {
        name: String,
        hook: &'static str,
        reason: String,
    },

    /// The outward event stream was closed by the consumer.
    #[error("event stream closed by consumer")]
    StreamClosed,

    // -- Run control ---------------------------------------------------------
    /// The run was cancelled via its cancellation handle.
    #[error("run cancelled")]
    Cancelled,

    /// The external approval source failed before producing a decision.
    #[error("approval source failed: {reason}")]
    ApprovalFailed { reason: String },

    // -- Configuration -------------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
