//! Prompt templates for the generation steps.
//!
//! [`build_prompt`] is pure: it resolves the step definition, checks that
//! every declared dependency is present in the context, and hands the context
//! to the step's prompt builder. The built-in builders render `{key}`
//! placeholders from the [`GenerationInput`](crate::context::GenerationInput)
//! and embed earlier steps' outputs as pretty-printed JSON under `{step}`
//! placeholders (e.g. `{architecture}`).

use crate::context::PipelineContext;
use crate::error::{GenerationError, Result};
use crate::step::{PromptBuilder, StepId, StepRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A rendered system + user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Build the prompt for `step` from the run's context.
///
/// Fails with [`GenerationError::UnknownStep`] if the step has no definition,
/// and with [`GenerationError::MissingDependency`] if a declared dependency's
/// output is absent from the context.
pub fn build_prompt(
    registry: &StepRegistry,
    step: StepId,
    context: &PipelineContext,
) -> Result<Prompt> {
    let definition = registry.get(step)?;
    for dep in &definition.dependencies {
        if !context.contains(*dep) {
            return Err(GenerationError::MissingDependency {
                step,
                missing: *dep,
            });
        }
    }
    Ok((definition.prompt_builder)(context))
}

/// Render `{key}` placeholders in a single left-to-right pass.
///
/// Use `{{` for a literal `{` and `}}` for a literal `}`. Placeholders with
/// no matching variable are left as written. Substituted values are never
/// re-scanned, so values containing braces are inserted verbatim.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use webgen_pipeline::prompt::render;
///
/// let mut vars = HashMap::new();
/// vars.insert("name".to_string(), "Alice".to_string());
/// let result = render("Hello {name}, JSON: {{\"key\": \"val\"}}", &vars);
/// assert_eq!(result, r#"Hello Alice, JSON: {"key": "val"}"#);
/// ```
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            match tail[1..].find('}') {
                Some(end) => {
                    let key = &tail[1..1 + end];
                    match vars.get(key) {
                        Some(value) if is_placeholder_name(key) => out.push_str(value),
                        _ => out.push_str(&tail[..end + 2]),
                    }
                    rest = &tail[end + 2..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder_name(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Pretty-printed JSON for embedding a prior step's output in a prompt.
pub fn embed_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Variables available to step templates: the input's fields plus one
/// `{step}` variable per recorded output.
pub fn context_vars(context: &PipelineContext) -> HashMap<String, String> {
    let mut vars = context.input().template_vars();
    for (step, value) in context.outputs() {
        vars.insert(step.as_str().to_string(), embed_json(value));
    }
    vars
}

/// A [`PromptBuilder`] rendering a fixed system/user template pair.
pub fn builder_from_templates(
    system: impl Into<String>,
    user: impl Into<String>,
) -> PromptBuilder {
    let system = system.into();
    let user = user.into();
    Arc::new(move |context: &PipelineContext| {
        let vars = context_vars(context);
        Prompt {
            system: render(&system, &vars),
            user: render(&user, &vars),
        }
    })
}

/// The built-in prompt builder for a step.
pub fn template_builder(step: StepId) -> PromptBuilder {
    let (role, task) = match step {
        StepId::Architecture => (ARCHITECT_ROLE, ARCHITECTURE_TASK),
        StepId::Content => (COPYWRITER_ROLE, CONTENT_TASK),
        StepId::Layout => (LAYOUT_ROLE, LAYOUT_TASK),
        StepId::Export => (EXPORT_ROLE, EXPORT_TASK),
        StepId::Deployment => (DEPLOY_ROLE, DEPLOYMENT_TASK),
    };
    builder_from_templates(
        format!("{}\n\n{}", role, JSON_ONLY),
        format!("{}\n\n{}", BRIEF_BLOCK, task),
    )
}

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else: no prose, \
no explanations, no markdown fences. Use double quotes for all keys and strings.";

const ARCHITECT_ROLE: &str = "You are a senior information architect who plans \
small-business and portfolio websites.";

const COPYWRITER_ROLE: &str = "You are a conversion-focused website copywriter.";

const LAYOUT_ROLE: &str = "You are a UI designer who turns page content into a \
component tree for a responsive website.";

const EXPORT_ROLE: &str = "You are a front-end engineer who produces clean, \
dependency-free static HTML and CSS.";

const DEPLOY_ROLE: &str = "You are a DevOps engineer who prepares static sites \
for hosting platforms such as Vercel, Netlify, or GitHub Pages.";

const BRIEF_BLOCK: &str = "## Brief
{brief}

## Details
Site name: {site_name}
Business type: {business_type}
Target audience: {target_audience}
Style: {style}
Requested pages: {pages}";

const ARCHITECTURE_TASK: &str = "## Task
Plan the website's structure. Return JSON shaped like:
{{
  \"sitemap\": [\"home\", \"about\", \"contact\"],
  \"pages\": [
    {{\"slug\": \"home\", \"title\": \"Home\", \"purpose\": \"...\", \"sections\": [\"hero\", \"features\", \"cta\"]}}
  ],
  \"navigation\": [{{\"label\": \"Home\", \"href\": \"/\"}}],
  \"design_system\": {{
    \"colors\": {{\"primary\": \"#1f2937\", \"accent\": \"#f59e0b\", \"background\": \"#ffffff\"}},
    \"typography\": {{\"heading\": \"Inter\", \"body\": \"Inter\"}},
    \"spacing\": \"comfortable\"
  }}
}}
Every sitemap entry must have a matching page.";

const CONTENT_TASK: &str = "## Site architecture
{architecture}

## Task
Write the copy for every page in the architecture above, matching the brief's \
tone. Return JSON shaped like:
{{
  \"pages\": [
    {{
      \"slug\": \"home\",
      \"sections\": [
        {{\"type\": \"hero\", \"heading\": \"...\", \"body\": \"...\", \"cta\": {{\"label\": \"...\", \"href\": \"/contact\"}}}}
      ]
    }}
  ],
  \"seo\": {{\"title\": \"...\", \"description\": \"...\"}}
}}
Use the same slugs and section order as the architecture.";

const LAYOUT_TASK: &str = "## Site architecture
{architecture}

## Page content
{content}

## Task
Lay out each page as a tree of components. Keep all copy from the content \
verbatim. Return JSON shaped like:
{{
  \"pages\": [
    {{
      \"slug\": \"home\",
      \"components\": [
        {{\"type\": \"Hero\", \"props\": {{\"heading\": \"...\", \"body\": \"...\"}}, \"children\": []}}
      ]
    }}
  ],
  \"theme\": {{\"colors\": {{}}, \"fonts\": {{}}, \"radius\": \"8px\"}}
}}";

const EXPORT_TASK: &str = "## Page layout
{layout}

## Task
Render the layout as a static website. Produce one HTML file per page plus a \
shared stylesheet; no external scripts or build step. Return JSON shaped like:
{{
  \"entry_point\": \"index.html\",
  \"files\": [
    {{\"path\": \"index.html\", \"content\": \"<!doctype html>...\"}},
    {{\"path\": \"styles.css\", \"content\": \"...\"}}
  ]
}}
Escape quotes and newlines inside file contents so the JSON stays valid.";

const DEPLOYMENT_TASK: &str = "## Static export
{export}

## Task
Prepare a deployment plan for the exported files. Return JSON shaped like:
{{
  \"platform\": \"vercel\",
  \"build\": {{\"command\": null}},
  \"output_directory\": \".\",
  \"environment\": {{}},
  \"config_files\": [{{\"path\": \"vercel.json\", \"content\": \"...\"}}]
}}
Choose the platform best suited to a static site unless the export says otherwise.";
