//! Debug-tracking middleware.
//!
//! Records a structured trace of the run at a configurable level of detail
//! and flushes it to a sink when the run ends.  Purely an observer: it never
//! swallows or rewrites events.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::event::AgentEvent;
use crate::middleware::{Middleware, RunOutcome};

/// Longest `input`/`output` payload kept in a standard-level record.
const STANDARD_PAYLOAD_LIMIT: usize = 500;

/// How much of the run the trace captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DebugLevel {
    /// Record nothing.
    Off,
    /// Tool invocations with timings, plus terminal events.
    Basic,
    /// Basic plus model calls, plan events, and truncated payloads.
    #[default]
    Standard,
    /// Everything verbatim, including individual token deltas.
    Full,
}

impl DebugLevel {
    fn captures(self, event: &AgentEvent) -> bool {
        match self {
            DebugLevel::Off => false,
            DebugLevel::Basic => matches!(
                event,
                AgentEvent::ToolStart { .. }
                    | AgentEvent::ToolEnd { .. }
                    | AgentEvent::Done
                    | AgentEvent::Error { .. }
            ),
            DebugLevel::Standard => !matches!(event, AgentEvent::Token { .. }),
            DebugLevel::Full => true,
        }
    }
}

/// Cap string payload fields in a recorded event value.
///
/// Standard-level records keep call structure and timings but bound the
/// `input`/`output` echoes; full level stores events verbatim.
fn truncate_payloads(value: &mut serde_json::Value) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    for key in ["input", "output"] {
        if let Some(serde_json::Value::String(s)) = map.get_mut(key) {
            if s.len() > STANDARD_PAYLOAD_LIMIT {
                let mut end = STANDARD_PAYLOAD_LIMIT;
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                s.truncate(end);
                s.push_str("...");
            }
        }
    }
}

/// One recorded trace entry.
#[derive(Debug, Clone, Serialize)]
pub struct DebugRecord {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub event: serde_json::Value,
}

/// Destination for a finished trace.
pub trait DebugSink: Send + Sync {
    fn flush(&self, session_id: &str, records: &[DebugRecord]) -> Result<()>;
}

/// Writes each run's trace as a JSON array to `<dir>/<session_id>.json`.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DebugSink for JsonFileSink {
    fn flush(&self, session_id: &str, records: &[DebugRecord]) -> Result<()> {
        let path = self.dir.join(format!("{session_id}.json"));
        let body = serde_json::to_vec_pretty(records)?;
        let mut file = std::fs::File::create(&path)
            .map_err(|e| EngineError::Internal(format!("debug trace {}: {e}", path.display())))?;
        file.write_all(&body)
            .map_err(|e| EngineError::Internal(format!("debug trace {}: {e}", path.display())))?;
        Ok(())
    }
}

/// Collects a run trace and flushes it at run end.
pub struct DebugMiddleware {
    level: DebugLevel,
    sink: Box<dyn DebugSink>,
    records: Mutex<Vec<DebugRecord>>,
}

impl DebugMiddleware {
    pub fn new(level: DebugLevel, sink: Box<dyn DebugSink>) -> Self {
        Self {
            level,
            sink,
            records: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Middleware for DebugMiddleware {
    fn name(&self) -> &str {
        "debug"
    }

    async fn on_run_start(&self, ctx: &RunContext) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(session_id = %ctx.session_id, level = ?self.level, "debug trace started");
        Ok(())
    }

    async fn on_event(&self, event: AgentEvent, _ctx: &RunContext) -> Result<Option<AgentEvent>> {
        if self.level.captures(&event) {
            let mut value = serde_json::to_value(&event)?;
            if self.level < DebugLevel::Full {
                truncate_payloads(&mut value);
            }
            let record = DebugRecord {
                at: Utc::now(),
                kind: event.kind().to_string(),
                event: value,
            };
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record);
        }
        Ok(Some(event))
    }

    async fn on_run_end(&self, ctx: &RunContext, outcome: &RunOutcome) -> Result<()> {
        if self.level == DebugLevel::Off {
            return Ok(());
        }
        let records = std::mem::take(
            &mut *self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::debug!(
            session_id = %ctx.session_id,
            records = records.len(),
            outcome = ?outcome,
            "flushing debug trace"
        );
        self.sink.flush(&ctx.session_id, &records)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
