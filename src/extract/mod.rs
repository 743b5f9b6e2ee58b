//! JSON extraction from free-form model text.
//!
//! Models wrap their JSON in prose, markdown fences and reasoning blocks, and
//! now and then emit near-JSON. [`extract_json`] recovers a value with four
//! strategies tried in a fixed order:
//!
//! 1. **Direct**: the whole text parses, as given or once `<think>` blocks
//!    are stripped.
//! 2. **Braces**: the first top-level balanced `{...}` substring parses.
//! 3. **Fenced**: the body of the first ```` ```json ```` block parses.
//! 4. **Repaired**: [`repair_json`] fixes a candidate, which then parses.
//!
//! Reasoning blocks are only stripped once the untouched text has failed to
//! parse, so string values that mention `<think>` survive intact.
//!
//! When all four fail the raw text is returned inside
//! [`GenerationError::UnparsableResponse`]; an empty object is never
//! substituted.

mod repair;

pub use repair::repair_json;

use crate::error::{GenerationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which strategy produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Direct,
    Braces,
    Fenced,
    Repaired,
}

/// An extracted value plus the strategy that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    pub method: ExtractionMethod,
}

/// Extract a JSON value from model output.
///
/// # Example
///
/// ```
/// use webgen_pipeline::extract::extract_json;
///
/// let raw = "Here is the plan:\n```json\n{\"sitemap\": [\"home\"]}\n```";
/// let value = extract_json(raw).unwrap();
/// assert_eq!(value["sitemap"][0], "home");
/// ```
pub fn extract_json(raw: &str) -> Result<Value> {
    extract_json_detailed(raw).map(|e| e.value)
}

/// [`extract_json`], also reporting the strategy that succeeded.
pub fn extract_json_detailed(raw: &str) -> Result<Extracted> {
    let found = |value: Value, method| Extracted { value, method };

    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Ok(found(value, ExtractionMethod::Direct));
    }

    let text = strip_think_tags(raw);
    let text = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(found(value, ExtractionMethod::Direct));
    }

    let braces = first_balanced_object(text);
    if let Some(candidate) = braces {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(found(value, ExtractionMethod::Braces));
        }
    }

    let fenced = fenced_block(text, "json");
    if let Some(body) = fenced {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return Ok(found(value, ExtractionMethod::Fenced));
        }
    }

    // Repair the most specific candidate first; a truncated object has no
    // closing brace, so also try everything from the first `{` onwards.
    let tail = text.find('{').map(|start| &text[start..]);
    let candidates = [fenced, braces, tail, Some(text)];
    for candidate in candidates.into_iter().flatten() {
        if let Some(fixed) = repair_json(candidate) {
            if let Ok(value) = serde_json::from_str::<Value>(&fixed) {
                return Ok(found(value, ExtractionMethod::Repaired));
            }
        }
    }

    Err(GenerationError::UnparsableResponse {
        raw: raw.to_string(),
    })
}

/// Remove `<think>...</think>` and `<thinking>...</thinking>` blocks.
///
/// An unclosed block swallows the rest of the text.
pub fn strip_think_tags(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        while let Some(start) = out.find(open) {
            match out[start..].find(close) {
                Some(offset) => {
                    out.replace_range(start..start + offset + close.len(), "");
                }
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

/// The first `{...}` substring whose braces balance, ignoring braces inside
/// strings.
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Body of the first fenced code block labelled `lang` (case-insensitive).
pub fn fenced_block<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(offset) = text[from..].find("```") {
        let label_start = from + offset + 3;
        let line_end = label_start + text[label_start..].find('\n')?;
        let body_start = line_end + 1;
        let body_len = text[body_start..].find("```")?;

        if text[label_start..line_end].trim().eq_ignore_ascii_case(lang) {
            return Some(text[body_start..body_start + body_len].trim());
        }
        from = body_start + body_len + 3;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn method(raw: &str) -> ExtractionMethod {
        extract_json_detailed(raw).unwrap().method
    }

    #[test]
    fn test_direct() {
        assert_eq!(extract_json(r#"  {"a": 1}  "#).unwrap(), json!({"a": 1}));
        assert_eq!(method(r#"{"a": 1}"#), ExtractionMethod::Direct);
    }

    #[test]
    fn test_braces_in_prose() {
        let raw = r#"Sure! Here you go: {"sitemap": ["home", "about"], "note": "use {braces}"} Hope it helps."#;
        let extracted = extract_json_detailed(raw).unwrap();
        assert_eq!(extracted.method, ExtractionMethod::Braces);
        assert_eq!(extracted.value["sitemap"], json!(["home", "about"]));
        assert_eq!(extracted.value["note"], "use {braces}");
    }

    #[test]
    fn test_first_object_wins() {
        let raw = r#"{"first": true} and then {"second": true}"#;
        assert_eq!(extract_json(raw).unwrap(), json!({"first": true}));
    }

    #[test]
    fn test_fenced_array() {
        let raw = "Pages:\n```json\n[\"home\", \"menu\"]\n```\n";
        let extracted = extract_json_detailed(raw).unwrap();
        assert_eq!(extracted.method, ExtractionMethod::Fenced);
        assert_eq!(extracted.value, json!(["home", "menu"]));
    }

    #[test]
    fn test_fenced_label_is_case_insensitive() {
        assert_eq!(fenced_block("```JSON\n[1]\n```", "json"), Some("[1]"));
        assert_eq!(fenced_block("```html\n<p>\n```\n```json\n[2]\n```", "json"), Some("[2]"));
        assert_eq!(fenced_block("```json\n[1]", "json"), None);
    }

    #[test]
    fn test_repaired() {
        assert_eq!(extract_json(r#"{"a":1,}"#).unwrap(), json!({"a": 1}));
        assert_eq!(extract_json("{'a':1}").unwrap(), json!({"a": 1}));
        assert_eq!(method("{'a':1}"), ExtractionMethod::Repaired);
    }

    #[test]
    fn test_repaired_inside_fence_and_prose() {
        let raw = "Result:\n```json\n{'title': 'Crumb', 'pages': ['home',],}\n```";
        assert_eq!(
            extract_json(raw).unwrap(),
            json!({"title": "Crumb", "pages": ["home"]})
        );
    }

    #[test]
    fn test_truncated_object_is_repaired() {
        let raw = r#"Here is the layout: {"pages": [{"slug": "home"}"#;
        assert_eq!(
            extract_json(raw).unwrap(),
            json!({"pages": [{"slug": "home"}]})
        );
    }

    #[test]
    fn test_think_tags_stripped() {
        let raw = "<think>maybe {\"wrong\": 1}</think>{\"right\": 2}";
        let extracted = extract_json_detailed(raw).unwrap();
        assert_eq!(extracted.value, json!({"right": 2}));
        assert_eq!(extracted.method, ExtractionMethod::Direct);
        assert_eq!(strip_think_tags("<thinking>a</thinking>b<think>c"), "b");
    }

    #[test]
    fn test_think_tag_text_inside_valid_json_is_kept() {
        for raw in [
            r#"{"note":"use <think> tags"}"#,
            r#"{"note":"<thinking>draft</thinking> then done", "n": 1}"#,
            r#"["<think>", "</think>"]"#,
        ] {
            let extracted = extract_json_detailed(raw).unwrap();
            assert_eq!(extracted.method, ExtractionMethod::Direct, "{raw}");
            assert_eq!(extracted.value, serde_json::from_str::<Value>(raw).unwrap());
        }
        assert_eq!(
            extract_json(r#"{"note":"use <think> tags"}"#).unwrap(),
            json!({"note": "use <think> tags"})
        );
    }

    #[test]
    fn test_unparsable_keeps_raw_text() {
        let err = extract_json("I cannot help with that.").unwrap_err();
        match err {
            GenerationError::UnparsableResponse { raw } => assert_eq!(raw, "I cannot help with that."),
            other => panic!("expected unparsable, got {other:?}"),
        }
    }

    #[test]
    fn test_first_balanced_object_unbalanced() {
        assert_eq!(first_balanced_object(r#"{"a": {"b": 1}"#), None);
        assert_eq!(first_balanced_object("no braces"), None);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 {}'\\[\\],:<>/]{0,12}".prop_map(Value::String),
            prop_oneof![Just("<think>"), Just("</think>"), Just("<thinking>"), Just("</thinking>")]
                .prop_map(|tag| Value::String(format!("see {tag} here"))),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_extract_is_idempotent(value in arb_json()) {
            let first = extract_json(&value.to_string()).unwrap();
            prop_assert_eq!(&first, &value);
            let again = extract_json(&first.to_string()).unwrap();
            prop_assert_eq!(again, first);
        }

        #[test]
        fn prop_valid_json_parses_directly(value in arb_json()) {
            let extracted = extract_json_detailed(&value.to_string()).unwrap();
            prop_assert_eq!(extracted.method, ExtractionMethod::Direct);
            prop_assert_eq!(extracted.value, value);
        }

        #[test]
        fn prop_object_survives_surrounding_prose(
            value in prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..5),
            prefix in "[a-zA-Z .!]{0,20}",
            suffix in "[a-zA-Z .!]{0,20}",
        ) {
            let object = Value::Object(value.into_iter().map(|(k, v)| (k, json!(v))).collect());
            let raw = format!("{}{}{}", prefix, object, suffix);
            prop_assert_eq!(extract_json(&raw).unwrap(), object);
        }
    }
}
