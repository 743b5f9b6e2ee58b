//! Step identifiers and the step definition registry.
//!
//! Steps are data, not types: each [`StepDefinition`] binds a prompt builder
//! to an output contract (required dot-paths plus defaults to backfill). The
//! [`StepRegistry`] is keyed by the closed [`StepId`] enum, so dispatch is
//! resolved when the registry is built rather than by string lookup.

use crate::context::PipelineContext;
use crate::error::{GenerationError, Result};
use crate::prompt::{self, Prompt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One named stage of the generation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Architecture,
    Content,
    Layout,
    Export,
    Deployment,
}

impl StepId {
    /// All steps in canonical pipeline order.
    pub const ALL: [StepId; 5] = [
        StepId::Architecture,
        StepId::Content,
        StepId::Layout,
        StepId::Export,
        StepId::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Architecture => "architecture",
            StepId::Content => "content",
            StepId::Layout => "layout",
            StepId::Export => "export",
            StepId::Deployment => "deployment",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the system and user prompt for a step from the run's context.
pub type PromptBuilder = Arc<dyn Fn(&PipelineContext) -> Prompt + Send + Sync>;

/// Immutable description of one step: its prompt and its output contract.
#[derive(Clone)]
pub struct StepDefinition {
    pub id: StepId,
    /// Human-readable name shown to end users on failure.
    pub display_name: String,
    /// Earlier steps whose output is embedded in this step's prompt.
    pub dependencies: Vec<StepId>,
    /// Dot-paths that must exist in the validated output, in check order.
    pub required_fields: Vec<String>,
    /// Defaults inserted for missing required fields, keyed by dot-path.
    pub defaults: Vec<(String, Value)>,
    pub prompt_builder: PromptBuilder,
}

impl StepDefinition {
    /// Create a definition with no dependencies and an empty contract.
    pub fn new(id: StepId, display_name: impl Into<String>, prompt_builder: PromptBuilder) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            dependencies: Vec::new(),
            required_fields: Vec::new(),
            defaults: Vec::new(),
            prompt_builder,
        }
    }

    /// Declare a dependency on an earlier step's output.
    pub fn depends_on(mut self, step: StepId) -> Self {
        if !self.dependencies.contains(&step) {
            self.dependencies.push(step);
        }
        self
    }

    /// Require a dot-path in the step's output.
    pub fn requires(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !self.required_fields.contains(&path) {
            self.required_fields.push(path);
        }
        self
    }

    /// Require a dot-path, backfilling `default` when the model omits it.
    pub fn requires_or(mut self, path: impl Into<String>, default: Value) -> Self {
        let path = path.into();
        self.defaults.retain(|(p, _)| p != &path);
        self.defaults.push((path.clone(), default));
        self.requires(path)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("dependencies", &self.dependencies)
            .field("required_fields", &self.required_fields)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Step definitions keyed by [`StepId`].
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    definitions: BTreeMap<StepId, StepDefinition>,
}

impl StepRegistry {
    /// A registry with no definitions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The five website-generation steps with their built-in templates.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for id in StepId::ALL {
            registry.register(standard_definition(id));
        }
        registry
    }

    /// Add or replace a definition.
    pub fn register(&mut self, definition: StepDefinition) -> &mut Self {
        self.definitions.insert(definition.id, definition);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, definition: StepDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, id: StepId) -> Result<&StepDefinition> {
        self.definitions
            .get(&id)
            .ok_or(GenerationError::UnknownStep(id))
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.definitions.contains_key(&id)
    }

    /// Check that `steps` can run in order: non-empty, no repeats, every step
    /// registered, and every dependency listed before the step that needs it.
    pub fn check_sequence(&self, steps: &[StepId]) -> Result<()> {
        if steps.is_empty() {
            return Err(GenerationError::InvalidConfig("step sequence is empty".into()));
        }
        for (index, step) in steps.iter().enumerate() {
            let earlier = &steps[..index];
            if earlier.contains(step) {
                return Err(GenerationError::InvalidConfig(format!(
                    "step '{}' appears more than once",
                    step
                )));
            }
            let definition = self.get(*step)?;
            if let Some(dep) = definition.dependencies.iter().find(|d| !earlier.contains(*d)) {
                return Err(GenerationError::InvalidConfig(format!(
                    "step '{}' needs '{}' to run before it",
                    step, dep
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn standard_definition(id: StepId) -> StepDefinition {
    let builder = prompt::template_builder(id);
    match id {
        StepId::Architecture => StepDefinition::new(id, "Site architecture", builder)
            .requires("sitemap")
            .requires("pages")
            .requires_or("navigation", json!([]))
            .requires_or(
                "design_system",
                json!({"colors": {}, "typography": {}, "spacing": "comfortable"}),
            ),
        StepId::Content => StepDefinition::new(id, "Page content", builder)
            .depends_on(StepId::Architecture)
            .requires("pages")
            .requires_or("seo.title", json!(""))
            .requires_or("seo.description", json!("")),
        StepId::Layout => StepDefinition::new(id, "Page layout", builder)
            .depends_on(StepId::Architecture)
            .depends_on(StepId::Content)
            .requires("pages")
            .requires_or("theme", json!({})),
        StepId::Export => StepDefinition::new(id, "Static export", builder)
            .depends_on(StepId::Layout)
            .requires("files")
            .requires_or("entry_point", json!("index.html")),
        StepId::Deployment => StepDefinition::new(id, "Deployment plan", builder)
            .depends_on(StepId::Export)
            .requires("platform")
            .requires_or("build.command", Value::Null)
            .requires_or("output_directory", json!("."))
            .requires_or("environment", json!({})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_id_serde_and_display() {
        assert_eq!(StepId::Architecture.to_string(), "architecture");
        let parsed: StepId = serde_json::from_str("\"deployment\"").unwrap();
        assert_eq!(parsed, StepId::Deployment);
        assert_eq!(serde_json::to_string(&StepId::Layout).unwrap(), "\"layout\"");
    }

    #[test]
    fn test_canonical_order() {
        let mut sorted = StepId::ALL;
        sorted.sort();
        assert_eq!(sorted, StepId::ALL);
    }

    #[test]
    fn test_standard_registry_has_every_step() {
        let registry = StepRegistry::standard();
        assert_eq!(registry.len(), StepId::ALL.len());
        for id in StepId::ALL {
            assert_eq!(registry.get(id).unwrap().id, id);
        }
    }

    #[test]
    fn test_unknown_step() {
        let registry = StepRegistry::empty();
        let err = registry.get(StepId::Content).unwrap_err();
        assert!(matches!(err, GenerationError::UnknownStep(StepId::Content)));
    }

    #[test]
    fn test_dependencies_point_backwards() {
        let registry = StepRegistry::standard();
        for id in StepId::ALL {
            for dep in &registry.get(id).unwrap().dependencies {
                assert!(*dep < id, "{} depends on later step {}", id, dep);
            }
        }
    }

    #[test]
    fn test_check_sequence() {
        let registry = StepRegistry::standard();
        assert!(registry.check_sequence(&StepId::ALL).is_ok());
        assert!(registry
            .check_sequence(&[StepId::Architecture, StepId::Content, StepId::Layout])
            .is_ok());

        for steps in [
            &[][..],
            &[StepId::Content][..],
            &[StepId::Content, StepId::Architecture][..],
            &[StepId::Architecture, StepId::Layout][..],
            &[StepId::Architecture, StepId::Architecture][..],
        ] {
            let err = registry.check_sequence(steps).unwrap_err();
            assert!(matches!(err, GenerationError::InvalidConfig(_)), "{steps:?} gave {err:?}");
        }

        let err = registry.check_sequence(&[StepId::Content]).unwrap_err();
        assert!(err.to_string().contains("architecture"));

        let err = StepRegistry::empty().check_sequence(&[StepId::Layout]).unwrap_err();
        assert!(matches!(err, GenerationError::UnknownStep(StepId::Layout)));
    }

    #[test]
    fn test_requires_or_replaces_default() {
        let def = StepDefinition::new(StepId::Architecture, "x", prompt::template_builder(StepId::Architecture))
            .requires_or("a.b", json!(1))
            .requires_or("a.b", json!(2));
        assert_eq!(def.required_fields, vec!["a.b".to_string()]);
        assert_eq!(def.defaults, vec![("a.b".to_string(), json!(2))]);
    }
}
