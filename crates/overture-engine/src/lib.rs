//! Overture: a two-stage agent orchestration engine.
//!
//! Each request runs a direct reasoning pass first.  If the model commits a
//! multi-step plan during that pass, execution hands off to a plan stage
//! that runs each step in its own restricted reasoning loop, consulting a
//! replanning evaluator between steps.  An optional approval gate sits
//! between the two stages.
//!
//! Everything a run produces flows through one standardized event stream
//! ([`event::AgentEvent`]), suitable for SSE framing or any other transport.
//! The engine is transport-agnostic and model-provider-agnostic: hosts
//! supply a [`model::ModelClient`] implementation and consume the stream.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use overture_engine::{Runner, RunContext, EngineConfig, ToolRegistry};
//! # use overture_engine::approval::AutoApprove;
//! # use overture_engine::model::cache::ModelCache;
//! # async fn example(cache: Arc<ModelCache>) {
//! let config = Arc::new(EngineConfig::default());
//! let runner = Runner::new(cache, Arc::new(ToolRegistry::new()), Arc::new(AutoApprove));
//!
//! let mut ctx = RunContext::new("session-1", config);
//! ctx.message = "Compare the three main Rust async runtimes".to_string();
//! let mut events = runner.run(ctx);
//! while let Some(event) = events.recv().await {
//!     println!("{}", overture_engine::event::serialize_sse(&event).unwrap());
//! }
//! # }
//! ```

pub mod adapter;
pub mod approval;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod middleware;
pub mod model;
pub mod plan;
pub mod runner;
pub mod stage;
pub mod tool;

pub use config::EngineConfig;
pub use context::RunContext;
pub use error::{EngineError, Result};
pub use event::AgentEvent;
pub use plan::{PlanState, PlanStep, ReplanDecision, StepStatus};
pub use runner::Runner;
pub use tool::{Tool, ToolRegistry};
