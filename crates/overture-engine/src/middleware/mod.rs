//! Event middleware pipeline.
//!
//! Middlewares observe and optionally transform the primary event stream.
//! The interface is deliberately narrow: a run-start hook, a per-event hook,
//! and a run-end hook.  Ordering guarantees:
//!
//! * `on_run_start` runs for every middleware before the first event is
//!   produced; a failure there aborts the run.
//! * `on_event` runs in registration order.  Returning `Ok(None)` swallows
//!   the event: it reaches neither later observers nor the outward stream.
//!   An error from `on_event` aborts the run and surfaces as an `error`
//!   event.
//! * `on_run_end` runs exactly once per middleware, in registration order,
//!   on every outcome including failure and cancellation.

pub mod debug;

pub use debug::{DebugLevel, DebugMiddleware, DebugRecord, DebugSink, JsonFileSink};

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::Result;
use crate::event::AgentEvent;

/// Observer/transformer of the primary event stream.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable name for logs and error reports.
    fn name(&self) -> &str;

    /// Called once before any event is produced.
    async fn on_run_start(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Called for each primary event.  Return the event (possibly replaced)
    /// to pass it on, or `None` to swallow it.
    async fn on_event(&self, event: AgentEvent, _ctx: &RunContext) -> Result<Option<AgentEvent>> {
        Ok(Some(event))
    }

    /// Called exactly once when the run finishes, on any outcome.
    async fn on_run_end(&self, _ctx: &RunContext, _outcome: &RunOutcome) -> Result<()> {
        Ok(())
    }
}

/// How a run ended, as reported to `on_run_end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed { reason: String },
}

/// Run one event through the chain in registration order.
///
/// `Ok(None)` means some observer swallowed the event.  An observer error
/// propagates and aborts the run.
pub async fn apply_chain(
    middlewares: &[std::sync::Arc<dyn Middleware>],
    mut event: AgentEvent,
    ctx: &RunContext,
) -> Result<Option<AgentEvent>> {
    for mw in middlewares {
        match mw.on_event(event.clone(), ctx).await {
            Ok(Some(next)) => event = next,
            Ok(None) => {
                tracing::debug!(middleware = mw.name(), kind = event.kind(), "event swallowed");
                return Ok(None);
            }
            Err(e) => {
                return Err(crate::error::EngineError::MiddlewareFailed {
                    name: mw.name().to_string(),
                    hook: "on_event",
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
