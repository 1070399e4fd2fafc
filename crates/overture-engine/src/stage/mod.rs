//! Execution stages.
//!
//! A run is at most two stages: the direct stage always runs; the plan stage
//! runs only when the direct stage committed a plan.  Dispatch between them
//! is an explicit two-variant enum, not a general graph.

pub mod direct;
pub mod plan;
pub mod replan;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::event::AgentEvent;
use crate::middleware::{Middleware, apply_chain};

/// The two stages a run can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Direct,
    Plan,
}

/// Outward delivery path for stage events.
///
/// Every primary event passes through the middleware chain, and queued
/// side-channel events are interleaved ahead of it so plan events reach the
/// consumer no later than the next primary event.
pub struct EventPipe<'a> {
    out: &'a mpsc::Sender<AgentEvent>,
    middlewares: &'a [Arc<dyn Middleware>],
    ctx: &'a RunContext,
}

impl<'a> EventPipe<'a> {
    pub fn new(
        out: &'a mpsc::Sender<AgentEvent>,
        middlewares: &'a [Arc<dyn Middleware>],
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            out,
            middlewares,
            ctx,
        }
    }

    /// Drain queued side-channel events, then deliver one primary event.
    pub async fn forward(&self, event: AgentEvent) -> Result<()> {
        self.drain().await?;
        self.deliver(event).await
    }

    /// Deliver queued side-channel events only.  Called at stage boundaries
    /// and whenever the producer knows side-channel events may be pending.
    pub async fn drain(&self) -> Result<()> {
        for event in self.ctx.drain_side_channels() {
            self.deliver(event).await?;
        }
        Ok(())
    }

    /// Send a terminal event.  Terminal events bypass the middleware chain
    /// so a misbehaving middleware can never strip the stream's terminator.
    pub async fn send_terminal(&self, event: AgentEvent) -> Result<()> {
        debug_assert!(event.is_terminal());
        self.out
            .send(event)
            .await
            .map_err(|_| EngineError::StreamClosed)
    }

    async fn deliver(&self, event: AgentEvent) -> Result<()> {
        if let Some(event) = apply_chain(self.middlewares, event, self.ctx).await? {
            self.out
                .send(event)
                .await
                .map_err(|_| EngineError::StreamClosed)?;
        }
        Ok(())
    }
}
