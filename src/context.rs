use crate::error::{GenerationError, Result};
use crate::step::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// What the caller asked for: a freeform brief plus optional domain fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationInput {
    /// The user's description of the website.
    pub brief: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,

    /// Visual style hint (e.g. "minimal", "playful").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,

    /// Pages the user explicitly wants.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<String>,

    /// Any other domain fields; exposed to templates as `{key}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl GenerationInput {
    pub fn new(brief: impl Into<String>) -> Self {
        Self {
            brief: brief.into(),
            ..Default::default()
        }
    }

    pub fn with_site_name(mut self, name: impl Into<String>) -> Self {
        self.site_name = Some(name.into());
        self
    }

    pub fn with_business_type(mut self, business_type: impl Into<String>) -> Self {
        self.business_type = Some(business_type.into());
        self
    }

    pub fn with_target_audience(mut self, audience: impl Into<String>) -> Self {
        self.target_audience = Some(audience.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_page(mut self, page: impl Into<String>) -> Self {
        self.pages.push(page.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Template variables for `{key}` placeholders.
    ///
    /// Unset optional fields render as `"not specified"` so templates never
    /// leak raw placeholders to the model.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let unspecified = || "not specified".to_string();
        let mut vars = HashMap::new();
        for (key, value) in &self.extra {
            vars.insert(key.clone(), value.clone());
        }
        vars.insert("brief".into(), self.brief.clone());
        vars.insert(
            "site_name".into(),
            self.site_name.clone().unwrap_or_else(unspecified),
        );
        vars.insert(
            "business_type".into(),
            self.business_type.clone().unwrap_or_else(unspecified),
        );
        vars.insert(
            "target_audience".into(),
            self.target_audience.clone().unwrap_or_else(unspecified),
        );
        vars.insert("style".into(), self.style.clone().unwrap_or_else(unspecified));
        vars.insert(
            "pages".into(),
            if self.pages.is_empty() {
                unspecified()
            } else {
                self.pages.join(", ")
            },
        );
        vars
    }
}

/// Accumulated step outputs for one run.
///
/// Append-only: a step's output is recorded once and never replaced. Callers
/// may seed outputs from an earlier run with [`with_output`](Self::with_output)
/// to skip steps whose results are still valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    input: GenerationInput,
    outputs: BTreeMap<StepId, Value>,
}

impl PipelineContext {
    pub fn new(input: GenerationInput) -> Self {
        Self {
            input,
            outputs: BTreeMap::new(),
        }
    }

    /// Seed an output before the run starts. Replaces any earlier seed.
    pub fn with_output(mut self, step: StepId, value: Value) -> Self {
        self.outputs.insert(step, value);
        self
    }

    pub fn input(&self) -> &GenerationInput {
        &self.input
    }

    pub fn get(&self, step: StepId) -> Option<&Value> {
        self.outputs.get(&step)
    }

    pub fn contains(&self, step: StepId) -> bool {
        self.outputs.contains_key(&step)
    }

    /// Recorded outputs in canonical step order.
    pub fn outputs(&self) -> impl Iterator<Item = (StepId, &Value)> {
        self.outputs.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Record a step's validated output. Fails if the step already has one.
    pub(crate) fn record(&mut self, step: StepId, value: Value) -> Result<()> {
        if self.outputs.contains_key(&step) {
            return Err(GenerationError::InvalidConfig(format!(
                "output for step '{}' is already recorded",
                step
            )));
        }
        self.outputs.insert(step, value);
        Ok(())
    }
}
