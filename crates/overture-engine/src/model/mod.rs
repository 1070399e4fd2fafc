//! Model collaborator interfaces and wire types.
//!
//! The model call itself is an opaque capability: given a system prompt, a
//! tool set, and a message history, a [`ModelClient`] drives one reasoning
//! loop (alternating model calls and tool invocations) and emits raw
//! provider events.  The engine never talks to a provider directly: the
//! stream adapter translates [`RawLoopEvent`]s into standardized
//! [`crate::event::AgentEvent`]s and everything above works on those.

pub mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::RunContext;
use crate::error::Result;
use crate::tool::Tool;

pub use cache::{ModelCache, ModelResolver};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// Textual content.
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// A tool definition exposed to the model so it knows what it may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Usage tracking
// ---------------------------------------------------------------------------

/// Token usage reported by the model for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input (prompt).
    pub input_tokens: u32,
    /// Number of tokens generated by the model.
    pub output_tokens: u32,
}

impl Usage {
    /// Combined token count.
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Raw loop events
// ---------------------------------------------------------------------------

/// Provider-level events emitted while one reasoning loop runs.
///
/// These are the adapter's input; they carry no timing or cache information.
/// That is computed during translation.
#[derive(Debug, Clone)]
pub enum RawLoopEvent {
    /// An incremental text delta.
    TokenDelta { content: String },

    /// A model call began.
    ModelCallStart {
        /// Provider call identifier, used to correlate the matching end.
        call_id: String,
        /// Serialized input messages, for debug capture.
        input: String,
    },

    /// A model call finished.
    ModelCallEnd {
        call_id: String,
        /// Final text output of the call.
        output: String,
        /// Token usage, when the provider reports it.
        usage: Option<Usage>,
    },

    /// A tool invocation began.
    ToolCallStart {
        call_id: String,
        tool: String,
        input: String,
    },

    /// A tool invocation finished.  Tool failures arrive here as error
    /// content in `output`; they never abort the loop.
    ToolCallEnd {
        call_id: String,
        tool: String,
        output: String,
    },

    /// The loop failed at the model-call level.  Terminal for the loop.
    LoopError { message: String },
}

// ---------------------------------------------------------------------------
// Loop request
// ---------------------------------------------------------------------------

/// One reasoning-loop invocation.
pub struct LoopRequest {
    /// System prompt for the loop.
    pub system_prompt: String,

    /// Conversation history, oldest first.  The last entry is the message
    /// the loop should act on.
    pub history: Vec<Message>,

    /// Tools the loop may invoke.
    pub tools: Vec<Arc<dyn Tool>>,

    /// Upper bound on model/tool alternations within the loop.
    pub recursion_limit: u32,
}

// ---------------------------------------------------------------------------
// Model client
// ---------------------------------------------------------------------------

/// Connection configuration for one model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider endpoint base URL.
    pub api_base: String,

    /// Credential for the endpoint.
    pub api_key: String,

    /// Model identifier.
    pub model: String,

    /// Sampling temperature.
    pub temperature: f32,

    /// Maximum tokens per response.
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o".into(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// A reusable, configured model client.
///
/// Implementations are external collaborators; the engine only requires the
/// two capabilities below.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Drive one reasoning loop to completion.
    ///
    /// Raw events arrive on the returned receiver in emission order; the
    /// sequence is unbounded, single-pass, and non-restartable.  Dropping
    /// the receiver discards any pending output.
    async fn start_loop(
        &self,
        request: LoopRequest,
        ctx: Arc<RunContext>,
    ) -> Result<mpsc::Receiver<RawLoopEvent>>;

    /// One non-streaming completion constrained to `schema`.
    ///
    /// Returns the raw model output; the caller decodes it.
    async fn complete_structured(&self, prompt: &str, schema: Value) -> Result<String>;
}

/// Constructs [`ModelClient`]s from resolved configuration.
///
/// The [`ModelCache`] calls this exactly once per fingerprint miss.
pub trait ClientFactory: Send + Sync {
    /// Build a client for `config`, in streaming or non-streaming mode.
    fn build(&self, config: &ModelConfig, streaming: bool) -> Result<Arc<dyn ModelClient>>;
}
