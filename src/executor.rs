//! Step executor: one step from prompt to validated JSON.
//!
//! [`StepExecutor::execute`] chains the layers for a single step:
//!
//! ```text
//! build_prompt ──► with_resilience(Backend::complete | complete_streaming)
//!              ──► extract_json ──► validate_contract ──► StepResult
//! ```
//!
//! It never returns an error. Every failure is folded into a
//! [`StepResult`] with `success = false`, the error's [`ErrorKind`] and a
//! human-readable message, so the runner can record it and halt.

use crate::backend::{Backend, Completion, CompletionRequest};
use crate::cancel::CancelSignal;
use crate::context::PipelineContext;
use crate::contract::validate_contract;
use crate::error::{ErrorKind, GenerationError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::extract::{extract_json_detailed, ExtractionMethod};
use crate::prompt::build_prompt;
use crate::resilience::{with_resilience, ResiliencePolicy};
use crate::step::{StepId, StepRegistry};
use crate::usage::{RateTable, TokenUsage, UsageTracker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Per-call options for [`StepExecutor::execute`].
#[derive(Clone)]
pub struct ExecutorOptions {
    pub model: String,
    /// Sampling temperature in `[0, 2]`.
    pub temperature: f64,
    pub max_tokens: u32,
    /// Use the streaming transport and emit [`Event::Token`] per fragment.
    pub streaming: bool,
    /// Request a JSON object response format.
    pub json_mode: bool,
    pub cancel: Option<CancelSignal>,
    pub events: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for ExecutorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorOptions")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("streaming", &self.streaming)
            .field("json_mode", &self.json_mode)
            .field("cancel", &self.cancel.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

impl ExecutorOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
            streaming: false,
            json_mode: true,
            cancel: None,
            events: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_events(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GenerationError::InvalidConfig(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(GenerationError::InvalidConfig(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(GenerationError::InvalidConfig("model must not be empty".into()));
        }
        Ok(())
    }
}

/// The outcome of one step execution. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: StepId,
    /// The step's human-readable name, for end-user failure messages.
    pub display_name: String,
    pub success: bool,
    /// Validated output. `None` on failure.
    pub data: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub token_usage: TokenUsage,
    pub estimated_cost: f64,
    pub latency_ms: u64,
    pub retry_count: u32,
    pub model: String,
    /// Which extraction strategy recovered the JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionMethod>,
    /// Raw model text, kept when the output could not be used.
    ///
    /// For diagnostics only; not meant to be shown to end users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    /// Correlation id, increasing per executor.
    pub trace_id: u64,
}

/// What is known about a step so far; finished into a [`StepResult`].
struct Draft {
    step: StepId,
    display_name: String,
    model: String,
    trace_id: u64,
    started: Instant,
    retry_count: u32,
    usage: TokenUsage,
    cost: f64,
    extraction: Option<ExtractionMethod>,
    raw: Option<String>,
}

impl Draft {
    fn succeed(self, data: Value) -> StepResult {
        self.finish(Some(data), None)
    }

    fn fail(mut self, err: GenerationError) -> StepResult {
        if self.raw.is_none() {
            self.raw = err.raw_response().map(str::to_string);
        }
        self.finish(None, Some(err))
    }

    fn finish(self, data: Option<Value>, err: Option<GenerationError>) -> StepResult {
        StepResult {
            step: self.step,
            display_name: self.display_name,
            success: err.is_none(),
            data,
            error: err.as_ref().map(|e| e.to_string()),
            error_kind: err.as_ref().map(|e| e.kind()),
            token_usage: self.usage,
            estimated_cost: self.cost,
            latency_ms: self.started.elapsed().as_millis() as u64,
            retry_count: self.retry_count,
            model: self.model,
            extraction: self.extraction,
            raw_response: if err.is_some() { self.raw } else { None },
            trace_id: self.trace_id,
        }
    }
}

/// Executes single steps against a backend.
///
/// Holds the process-wide read-only configuration (registry, policy, rates)
/// and an optional shared [`UsageTracker`].
pub struct StepExecutor {
    backend: Arc<dyn Backend>,
    registry: Arc<StepRegistry>,
    policy: ResiliencePolicy,
    rates: Arc<RateTable>,
    tracker: Option<Arc<UsageTracker>>,
    next_trace: AtomicU64,
}

impl StepExecutor {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<StepRegistry>) -> Self {
        Self {
            backend,
            registry,
            policy: ResiliencePolicy::default(),
            rates: Arc::new(RateTable::new()),
            tracker: None,
            next_trace: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_rates(mut self, rates: Arc<RateTable>) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<UsageTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn tracker(&self) -> Option<&Arc<UsageTracker>> {
        self.tracker.as_ref()
    }

    /// Run one step: prompt, completion with retries, extraction, contract.
    pub async fn execute(
        &self,
        step: StepId,
        context: &PipelineContext,
        options: &ExecutorOptions,
    ) -> StepResult {
        let trace_id = self.next_trace.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("step", step = %step, trace_id, model = %options.model);
        self.execute_inner(step, context, options, trace_id)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        step: StepId,
        context: &PipelineContext,
        options: &ExecutorOptions,
        trace_id: u64,
    ) -> StepResult {
        let mut draft = Draft {
            step,
            display_name: self
                .registry
                .get(step)
                .map(|d| d.display_name.clone())
                .unwrap_or_else(|_| step.to_string()),
            model: options.model.clone(),
            trace_id,
            started: Instant::now(),
            retry_count: 0,
            usage: TokenUsage::default(),
            cost: 0.0,
            extraction: None,
            raw: None,
        };
        emit(options.events.as_ref(), Event::StepStarted { step, trace_id });

        let result = match self.run_stages(&mut draft, context, options).await {
            Ok(data) => {
                let result = draft.succeed(data);
                info!(
                    tokens = result.token_usage.total,
                    cost = result.estimated_cost,
                    latency_ms = result.latency_ms,
                    retries = result.retry_count,
                    "Step succeeded"
                );
                result
            }
            Err(err) => {
                if err.is_cancelled() {
                    info!("Step cancelled");
                } else {
                    warn!(kind = ?err.kind(), error = %err, "Step failed");
                }
                draft.fail(err)
            }
        };

        emit(
            options.events.as_ref(),
            Event::StepFinished {
                step,
                success: result.success,
                latency_ms: result.latency_ms,
            },
        );
        result
    }

    async fn run_stages(
        &self,
        draft: &mut Draft,
        context: &PipelineContext,
        options: &ExecutorOptions,
    ) -> Result<Value> {
        options.validate()?;
        let definition = self.registry.get(draft.step)?;
        let prompt = build_prompt(&self.registry, draft.step, context)?;

        let request = CompletionRequest {
            model: options.model.clone(),
            system_prompt: prompt.system,
            user_prompt: prompt.user,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            json_mode: options.json_mode,
        };
        debug!(
            system_chars = request.system_prompt.len(),
            user_chars = request.user_prompt.len(),
            streaming = options.streaming,
            "Prompt built"
        );

        let completion = self
            .complete(draft.step, &request, options, &mut draft.retry_count)
            .await?;

        draft.usage = completion.usage;
        draft.cost = self.rates.estimate_cost(&options.model, &completion.usage);
        if let Some(ref tracker) = self.tracker {
            tracker.record(&options.model, &completion.usage, draft.cost);
        }
        draft.raw = Some(completion.text);
        let text = draft.raw.as_deref().unwrap_or_default();

        let extracted = extract_json_detailed(text).inspect_err(|_| {
            debug!(raw = %text, "Model response is not JSON");
        })?;
        draft.extraction = Some(extracted.method);
        debug!(method = ?extracted.method, "JSON extracted");

        validate_contract(
            &extracted.value,
            &definition.required_fields,
            &definition.defaults,
        )
    }

    async fn complete(
        &self,
        step: StepId,
        request: &CompletionRequest,
        options: &ExecutorOptions,
        retry_count: &mut u32,
    ) -> Result<Completion> {
        let events = options.events.clone();
        let mut on_retry = |attempt: u32, delay: Duration, err: &GenerationError| {
            *retry_count = attempt;
            emit(
                events.as_ref(),
                Event::TransportRetry {
                    step,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: err.to_string(),
                },
            );
        };

        with_resilience(
            &self.policy,
            options.cancel.as_ref(),
            Some(&mut on_retry),
            |_attempt| {
                let backend = Arc::clone(&self.backend);
                let request = request.clone();
                let events = options.events.clone();
                let streaming = options.streaming;
                async move {
                    if !streaming {
                        return backend.complete(&request).await;
                    }
                    let mut forward = |delta: &str, accumulated: &str| {
                        emit(
                            events.as_ref(),
                            Event::Token {
                                step,
                                delta: delta.to_string(),
                                accumulated: accumulated.to_string(),
                            },
                        );
                    };
                    backend.complete_streaming(&request, &mut forward).await
                }
            },
        )
        .await
    }
}
