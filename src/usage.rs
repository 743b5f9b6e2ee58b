//! Token usage, per-model cost rates and the shared usage tracker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Rough characters-per-token ratio used when the provider reports no usage.
pub const CHARS_PER_TOKEN: usize = 4;

/// Token counts for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    /// Estimate usage from text lengths.
    pub fn estimate(prompt_text: &str, completion_text: &str) -> Self {
        let tokens = |s: &str| s.chars().count().div_ceil(CHARS_PER_TOKEN) as u64;
        Self::new(tokens(prompt_text), tokens(completion_text))
    }

    /// Parse an OpenAI-style `usage` object.
    ///
    /// Returns `None` unless both `prompt_tokens` and `completion_tokens` are
    /// present. `total_tokens` is taken as reported when available.
    pub fn from_openai(value: &Value) -> Option<Self> {
        let prompt = value.get("prompt_tokens")?.as_u64()?;
        let completion = value.get("completion_tokens")?.as_u64()?;
        let total = value
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(prompt + completion);
        Some(Self {
            prompt,
            completion,
            total,
        })
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt: self.prompt + rhs.prompt,
            completion: self.completion + rhs.completion,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// Static cost per 1K tokens, keyed by model id.
///
/// Read-only after construction and safe to share across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateTable {
    rates: HashMap<String, f64>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small table of common OpenRouter models (USD per 1K tokens, blended).
    pub fn openrouter_defaults() -> Self {
        Self::new()
            .with_rate("openai/gpt-4o", 0.005)
            .with_rate("openai/gpt-4o-mini", 0.0003)
            .with_rate("anthropic/claude-3.5-sonnet", 0.006)
            .with_rate("anthropic/claude-3-haiku", 0.0005)
            .with_rate("google/gemini-flash-1.5", 0.0002)
            .with_rate("meta-llama/llama-3.1-70b-instruct", 0.0004)
    }

    pub fn with_rate(mut self, model: impl Into<String>, per_1k: f64) -> Self {
        self.rates.insert(model.into(), per_1k);
        self
    }

    pub fn rate(&self, model: &str) -> Option<f64> {
        self.rates.get(model).copied()
    }

    /// `total / 1000 * rate`. Unknown models cost 0 and log a warning.
    pub fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.rate(model) {
            Some(rate) => usage.total as f64 / 1000.0 * rate,
            None => {
                warn!(model = %model, "No cost rate configured for model, estimating 0");
                0.0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

// Cost is accumulated in millionths of a currency unit so it fits an atomic.
const COST_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    prompt: AtomicU64,
    completion: AtomicU64,
    total: AtomicU64,
    cost_micros: AtomicU64,
}

impl Counters {
    fn add(&self, usage: &TokenUsage, cost: f64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.prompt.fetch_add(usage.prompt, Ordering::Relaxed);
        self.completion.fetch_add(usage.completion, Ordering::Relaxed);
        self.total.fetch_add(usage.total, Ordering::Relaxed);
        let micros = (cost.max(0.0) * COST_SCALE).round() as u64;
        self.cost_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            tokens: TokenUsage {
                prompt: self.prompt.load(Ordering::Relaxed),
                completion: self.completion.load(Ordering::Relaxed),
                total: self.total.load(Ordering::Relaxed),
            },
            cost: self.cost_micros.load(Ordering::Relaxed) as f64 / COST_SCALE,
        }
    }
}

/// Point-in-time view of accumulated usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub calls: u64,
    pub tokens: TokenUsage,
    pub cost: f64,
}

/// Process-wide usage and cost accumulator.
///
/// Every update is an independent atomic add, so concurrent runs never need
/// a lock around a read-then-write. The per-model map only takes its write
/// lock the first time a model is seen.
#[derive(Debug, Default)]
pub struct UsageTracker {
    overall: Counters,
    by_model: RwLock<HashMap<String, Arc<Counters>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completion's usage and cost.
    pub fn record(&self, model: &str, usage: &TokenUsage, cost: f64) {
        self.overall.add(usage, cost);
        self.model_counters(model).add(usage, cost);
    }

    fn model_counters(&self, model: &str) -> Arc<Counters> {
        if let Ok(map) = self.by_model.read() {
            if let Some(counters) = map.get(model) {
                return Arc::clone(counters);
            }
        }
        let mut map = match self.by_model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(map.entry(model.to_string()).or_default())
    }

    pub fn total(&self) -> UsageSnapshot {
        self.overall.snapshot()
    }

    pub fn for_model(&self, model: &str) -> Option<UsageSnapshot> {
        let map = match self.by_model.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(model).map(|c| c.snapshot())
    }

    /// Per-model snapshots, sorted by model id.
    pub fn by_model(&self) -> Vec<(String, UsageSnapshot)> {
        let map = match self.by_model.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<_> = map
            .iter()
            .map(|(model, c)| (model.clone(), c.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
