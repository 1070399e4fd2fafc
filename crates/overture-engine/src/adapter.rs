//! Translation from raw model-loop events to the outward event model.
//!
//! An [`EventStream`] wraps the receiver a [`ModelClient`] loop produces and
//! yields [`AgentEvent`]s one at a time.  Translation happens inline in the
//! consumer's task; nothing is spawned.  The stream tracks per-call timing so
//! `model-call-end` and `tool-end` carry wall-clock durations, and it resolves
//! the cache sentinel on tool output before the event leaves the engine.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::event::AgentEvent;
use crate::model::RawLoopEvent;
use crate::tool::CACHE_HIT_PREFIX;

/// Longest input echo carried on a `model-call-start` event.
const INPUT_ECHO_LIMIT: usize = 5000;

/// In-flight call bookkeeping: start instant plus the input echo, so the
/// matching end event can carry both duration and input.
struct InFlight {
    started: Instant,
    input: String,
}

/// One stage's translated event stream.
pub struct EventStream {
    raw: mpsc::Receiver<RawLoopEvent>,
    node: String,
    model: String,
    motivation: String,
    prompt_prefix: String,
    cancel: CancellationToken,
    model_calls: HashMap<String, InFlight>,
    tool_calls: HashMap<String, Instant>,
}

impl EventStream {
    /// Wrap a raw loop receiver.
    ///
    /// `prompt_prefix` is the system prompt (plus any per-step instruction)
    /// prepended to the raw input echo on `model-call-start`, so debugging
    /// surfaces see the full prompt the model received.
    pub fn new(
        raw: mpsc::Receiver<RawLoopEvent>,
        node: impl Into<String>,
        model: impl Into<String>,
        motivation: impl Into<String>,
        prompt_prefix: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            raw,
            node: node.into(),
            model: model.into(),
            motivation: motivation.into(),
            prompt_prefix: prompt_prefix.into(),
            cancel,
            model_calls: HashMap::new(),
            tool_calls: HashMap::new(),
        }
    }

    /// Next translated event.
    ///
    /// `None` means the underlying loop finished cleanly.  A raw loop error
    /// or run cancellation surfaces as `Some(Err(..))`; the caller decides
    /// whether that ends the stage or the whole run.
    pub async fn next(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => return Some(Err(EngineError::Cancelled)),
                raw = self.raw.recv() => raw?,
            };
            if let Some(event) = self.translate(raw) {
                return Some(event);
            }
        }
    }

    /// Adapt into a [`futures::Stream`] for consumers that prefer combinators.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<AgentEvent>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }

    fn translate(&mut self, raw: RawLoopEvent) -> Option<Result<AgentEvent>> {
        match raw {
            RawLoopEvent::TokenDelta { content } => {
                if content.is_empty() {
                    return None;
                }
                Some(Ok(AgentEvent::token(content)))
            }
            RawLoopEvent::ModelCallStart { call_id, input } => {
                let full_input = if self.prompt_prefix.is_empty() {
                    input.clone()
                } else {
                    format!("{}\n\n{input}", self.prompt_prefix)
                };
                self.model_calls.insert(
                    call_id.clone(),
                    InFlight {
                        started: Instant::now(),
                        input: full_input.clone(),
                    },
                );
                Some(Ok(AgentEvent::ModelCallStart {
                    call_id,
                    node: self.node.clone(),
                    model: self.model.clone(),
                    input: truncate(&full_input, INPUT_ECHO_LIMIT),
                    motivation: self.motivation.clone(),
                }))
            }
            RawLoopEvent::ModelCallEnd {
                call_id,
                output,
                usage,
            } => {
                let in_flight = self.model_calls.remove(&call_id);
                let (duration_ms, input) = match in_flight {
                    Some(f) => (f.started.elapsed().as_millis() as u64, f.input),
                    // End without a tracked start; report it with zero timing
                    // rather than dropping the call record.
                    None => (0, String::new()),
                };
                let total_tokens = usage.as_ref().map(|u| u.total_tokens());
                Some(Ok(AgentEvent::ModelCallEnd {
                    call_id,
                    node: self.node.clone(),
                    model: self.model.clone(),
                    duration_ms,
                    input_tokens: usage.as_ref().map(|u| u.input_tokens),
                    output_tokens: usage.as_ref().map(|u| u.output_tokens),
                    total_tokens,
                    input: truncate(&input, INPUT_ECHO_LIMIT),
                    output,
                }))
            }
            RawLoopEvent::ToolCallStart {
                call_id,
                tool,
                input,
            } => {
                self.tool_calls.insert(call_id, Instant::now());
                Some(Ok(AgentEvent::ToolStart {
                    tool,
                    input,
                    motivation: self.motivation.clone(),
                }))
            }
            RawLoopEvent::ToolCallEnd {
                call_id,
                tool,
                output,
            } => {
                let duration_ms = self
                    .tool_calls
                    .remove(&call_id)
                    .map(|started| started.elapsed().as_millis() as u64);
                let (output, cached) = match output.strip_prefix(CACHE_HIT_PREFIX) {
                    Some(rest) => (rest.trim_start().to_string(), true),
                    None => (output, false),
                };
                Some(Ok(AgentEvent::ToolEnd {
                    tool,
                    output,
                    cached,
                    duration_ms,
                }))
            }
            RawLoopEvent::LoopError { message } => {
                Some(Err(EngineError::ModelCallFailed { reason: message }))
            }
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
