//! Output contracts: required dot-paths with optional defaults.

use crate::error::{GenerationError, Result};
use serde_json::{Map, Value};

/// Check that every `required` dot-path exists in `parsed`.
///
/// Paths are checked in order. A missing path with an entry in `defaults` is
/// filled in on a copy, creating intermediate objects as needed; a missing
/// path without a default fails with [`GenerationError::ContractViolation`]
/// naming it. `parsed` itself is never modified.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use webgen_pipeline::contract::validate_contract;
///
/// let defaults = vec![("a.b".to_string(), json!(0))];
/// let out = validate_contract(&json!({}), &["a.b".to_string()], &defaults).unwrap();
/// assert_eq!(out, json!({"a": {"b": 0}}));
/// ```
pub fn validate_contract(
    parsed: &Value,
    required: &[String],
    defaults: &[(String, Value)],
) -> Result<Value> {
    let mut out = parsed.clone();
    for path in required {
        if lookup(&out, path).is_some() {
            continue;
        }
        let default = defaults
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| GenerationError::ContractViolation { path: path.clone() })?;
        insert(&mut out, path, default)?;
    }
    Ok(out)
}

/// Resolve a dot-path. Numeric segments index into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn insert(root: &mut Value, path: &str, default: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(GenerationError::ContractViolation { path: path.into() });
    };

    let mut current = root;
    for segment in parents {
        // A `null` placeholder is treated as an empty object.
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return Err(GenerationError::ContractViolation { path: path.into() }),
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), default);
            Ok(())
        }
        _ => Err(GenerationError::ContractViolation { path: path.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_present_fields_pass_through() {
        let parsed = json!({"sitemap": ["home"], "pages": []});
        let out = validate_contract(&parsed, &paths(&["sitemap", "pages"]), &[]).unwrap();
        assert_eq!(out, parsed);
    }

    #[test]
    fn test_nested_default_creates_parents() {
        let defaults = vec![("a.b".to_string(), json!(0))];
        let out = validate_contract(&json!({}), &paths(&["a.b"]), &defaults).unwrap();
        assert_eq!(out, json!({"a": {"b": 0}}));
    }

    #[test]
    fn test_original_is_not_mutated() {
        let parsed = json!({"pages": []});
        let defaults = vec![("seo.title".to_string(), json!(""))];
        let out = validate_contract(&parsed, &paths(&["pages", "seo.title"]), &defaults).unwrap();
        assert_eq!(parsed, json!({"pages": []}));
        assert_eq!(out["seo"]["title"], "");
    }

    #[test]
    fn test_missing_without_default_names_path() {
        let err = validate_contract(&json!({"pages": []}), &paths(&["pages", "sitemap"]), &[]).unwrap_err();
        match err {
            GenerationError::ContractViolation { path } => assert_eq!(path, "sitemap"),
            other => panic!("expected contract violation, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_null_counts_as_present() {
        let parsed = json!({"build": {"command": null}});
        let out = validate_contract(&parsed, &paths(&["build.command"]), &[]).unwrap();
        assert_eq!(out, parsed);
    }

    #[test]
    fn test_default_into_existing_object() {
        let parsed = json!({"seo": {"title": "Crumb"}});
        let defaults = vec![("seo.description".to_string(), json!(""))];
        let out = validate_contract(&parsed, &paths(&["seo.title", "seo.description"]), &defaults).unwrap();
        assert_eq!(out, json!({"seo": {"title": "Crumb", "description": ""}}));
    }

    #[test]
    fn test_default_cannot_descend_into_scalar() {
        let defaults = vec![("seo.title".to_string(), json!(""))];
        let err = validate_contract(&json!({"seo": "none"}), &paths(&["seo.title"]), &defaults).unwrap_err();
        assert!(matches!(err, GenerationError::ContractViolation { .. }));
    }

    #[test]
    fn test_lookup_indexes_arrays() {
        let value = json!({"pages": [{"slug": "home"}]});
        assert_eq!(lookup(&value, "pages.0.slug"), Some(&json!("home")));
        assert_eq!(lookup(&value, "pages.1.slug"), None);
    }
}
