//! # webgen-pipeline
//!
//! The generation core of an AI website builder: a fixed sequence of LLM
//! steps (architecture, content, layout, and optionally export and
//! deployment) turning a freeform brief into validated JSON.
//!
//! Each step renders a prompt from the outputs of the steps before it, calls
//! a chat-completion endpoint (buffered or streamed), recovers JSON from the
//! reply and checks it against the step's output contract. A run halts on the
//! first failed step.
//!
//! ## Core Concepts
//!
//! - **[`StepRegistry`]**: step prompts and contracts as data, keyed by the
//!   closed [`StepId`] enum.
//! - **[`Backend`]**: object-safe completion transport. [`OpenAiBackend`]
//!   speaks to OpenRouter and other OpenAI-compatible servers;
//!   [`MockBackend`] replays a script for tests.
//! - **[`StepExecutor`]**: prompt, completion with retries, JSON extraction
//!   and contract check for one step, folded into a [`StepResult`].
//! - **[`PipelineRunner`]**: drives a [`PipelineRun`] through
//!   `pending → running → completed | failed | cancelled`.
//! - **[`GenerationService`]**: start, observe and cancel runs by id.
//! - **[`UsageTracker`]**: process-wide token and cost accumulation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use webgen_pipeline::{GenerationInput, GeneratorConfig, RunStatus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GeneratorConfig::default();
//!     let runner = config.build_runner(Arc::new(config.backend()), None)?;
//!
//!     let input = GenerationInput::new("A site for a neighbourhood bakery")
//!         .with_site_name("Crumb")
//!         .with_page("home")
//!         .with_page("menu");
//!     let run = runner.run(runner.create_run(input)).await;
//!
//!     if let Some(site) = run.final_output() {
//!         println!("{:#}", site);
//!     } else if run.status == RunStatus::Failed {
//!         eprintln!("{:?}", run.error.map(|e| e.summary()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod context;
pub mod contract;
pub mod error;
pub mod events;
pub mod executor;
pub mod extract;
pub mod prompt;
pub mod resilience;
pub mod runner;
pub mod service;
pub mod step;
pub mod usage;

pub use backend::{Backend, Completion, CompletionRequest, MockBackend, MockReply, OpenAiBackend};
pub use cancel::CancelSignal;
pub use config::GeneratorConfig;
pub use context::{GenerationInput, PipelineContext};
pub use contract::validate_contract;
pub use error::{ErrorKind, GenerationError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use executor::{ExecutorOptions, StepExecutor, StepResult};
pub use extract::{extract_json, ExtractionMethod};
pub use prompt::{build_prompt, Prompt};
pub use resilience::{with_resilience, JitterStrategy, ResiliencePolicy};
pub use runner::{PipelineRun, PipelineRunner, RunError, RunStatus, RunTotals};
pub use service::GenerationService;
pub use step::{StepDefinition, StepId, StepRegistry};
pub use usage::{RateTable, TokenUsage, UsageTracker};
