//! File-based configuration.
//!
//! A `GeneratorConfig` is read from TOML; every field has a default, so an
//! empty file is valid:
//!
//! ```toml
//! steps = ["architecture", "content", "layout"]
//!
//! [endpoint]
//! base_url = "https://openrouter.ai/api/v1"
//! api_key_env = "OPENROUTER_API_KEY"
//! title = "Site Builder"
//!
//! [model]
//! id = "openai/gpt-4o-mini"
//! temperature = 0.7
//! max_tokens = 4096
//! streaming = true
//!
//! [resilience]
//! max_retries = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! timeout_ms = 60000
//! jitter = "full"
//!
//! [rates]
//! "openai/gpt-4o-mini" = 0.0003
//! ```

use crate::backend::openai::OPENROUTER_BASE_URL;
use crate::backend::{Backend, OpenAiBackend};
use crate::error::{GenerationError, Result};
use crate::executor::{ExecutorOptions, StepExecutor, DEFAULT_MODEL};
use crate::resilience::{JitterStrategy, ResiliencePolicy};
use crate::runner::PipelineRunner;
use crate::step::{StepId, StepRegistry};
use crate::usage::{RateTable, UsageTracker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Default environment variable holding the provider key.
pub const DEFAULT_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    pub endpoint: EndpointConfig,
    pub model: ModelConfig,
    pub resilience: ResilienceConfig,
    /// Cost per 1K tokens; merged over the built-in OpenRouter table.
    pub rates: HashMap<String, f64>,
    pub steps: Vec<StepId>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            model: ModelConfig::default(),
            resilience: ResilienceConfig::default(),
            rates: HashMap::new(),
            steps: vec![StepId::Architecture, StepId::Content, StepId::Layout],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub base_url: String,
    /// Name of the environment variable that holds the API key.
    pub api_key_env: String,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            referer: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub id: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub streaming: bool,
    pub json_mode: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            streaming: false,
            json_mode: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
    pub jitter: JitterStrategy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            timeout_ms: 60_000,
            jitter: JitterStrategy::None,
        }
    }
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> GenerationError {
    GenerationError::InvalidConfig(format!("{key}: {reason}"))
}

impl GeneratorConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| invalid("toml", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| invalid(&path.display().to_string(), e))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(invalid("model.temperature", "must be within [0, 2]"));
        }
        if self.model.max_tokens == 0 {
            return Err(invalid("model.max_tokens", "must be greater than 0"));
        }
        if self.model.id.trim().is_empty() {
            return Err(invalid("model.id", "must not be empty"));
        }
        StepRegistry::standard().check_sequence(&self.steps)?;
        let r = &self.resilience;
        if r.max_delay_ms < r.base_delay_ms {
            return Err(invalid("resilience.max_delay_ms", "must be >= base_delay_ms"));
        }
        if r.timeout_ms == 0 {
            return Err(invalid("resilience.timeout_ms", "must be greater than 0"));
        }
        if let Some((model, rate)) = self.rates.iter().find(|(_, r)| !r.is_finite() || **r < 0.0) {
            return Err(invalid("rates", format!("'{model}' has invalid rate {rate}")));
        }
        Ok(())
    }

    pub fn policy(&self) -> ResiliencePolicy {
        let r = &self.resilience;
        ResiliencePolicy::from_millis(r.max_retries, r.base_delay_ms, r.max_delay_ms, r.timeout_ms)
            .with_jitter(r.jitter)
    }

    pub fn rate_table(&self) -> RateTable {
        self.rates
            .iter()
            .fold(RateTable::openrouter_defaults(), |table, (model, rate)| {
                table.with_rate(model.clone(), *rate)
            })
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions::new(self.model.id.clone())
            .with_temperature(self.model.temperature)
            .with_max_tokens(self.model.max_tokens)
            .with_streaming(self.model.streaming)
            .with_json_mode(self.model.json_mode)
    }

    /// The HTTP backend, keyed from the configured environment variable.
    pub fn backend(&self) -> OpenAiBackend {
        OpenAiBackend::new(&self.endpoint.base_url)
            .with_api_key_from_env(&self.endpoint.api_key_env)
            .with_app_headers(self.endpoint.referer.clone(), self.endpoint.title.clone())
    }

    /// Assemble a runner over `backend` with the standard step registry.
    pub fn build_runner(
        &self,
        backend: Arc<dyn Backend>,
        tracker: Option<Arc<UsageTracker>>,
    ) -> Result<PipelineRunner> {
        self.validate()?;
        let mut executor = StepExecutor::new(backend, Arc::new(StepRegistry::standard()))
            .with_policy(self.policy())
            .with_rates(Arc::new(self.rate_table()));
        if let Some(tracker) = tracker {
            executor = executor.with_tracker(tracker);
        }
        PipelineRunner::new(Arc::new(executor), self.steps.clone(), self.executor_options())
    }
}
