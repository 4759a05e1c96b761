//! Template placeholders in request URIs.
//!
//! Two kinds are recognised:
//! - `{name}` / `{scope.name}`, filled from path parameters;
//! - `[[name]]` / `[[scope:name || default]]`, filled from the configuration
//!   lookup, falling back to the text after `||`.
//!
//! Placeholders without a value are left verbatim. Path parameter values are
//! percent-encoded so they always stay inside a single path segment.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::escape_component;
use crate::options::ConfigurationLookup;

static PATH_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\s*([A-Za-z_][\w.\-]*)\s*\}").expect("path placeholder pattern is valid")
});

static CONFIGURATION_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\s*([^\]|]+?)\s*(?:\|\|\s*([^\]]*?)\s*)?\]\]")
        .expect("configuration placeholder pattern is valid")
});

/// Replace `{name}` placeholders from `parameters`.
pub(crate) fn replace_path_placeholders(
    template: &str,
    parameters: &HashMap<String, String>,
) -> String {
    if parameters.is_empty() {
        return template.to_string();
    }
    PATH_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match parameters.get(&caps[1]) {
            Some(value) => escape_component(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Replace `[[key || default]]` placeholders through `lookup`.
pub(crate) fn replace_configuration_placeholders(
    template: &str,
    lookup: &dyn ConfigurationLookup,
) -> String {
    CONFIGURATION_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            if let Some(value) = lookup.get(&caps[1]) {
                return value;
            }
            match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Flatten a serialized object into `prefix.key` parameters.
pub(crate) fn flatten_parameters(
    prefix: Option<&str>,
    value: &serde_json::Value,
    out: &mut HashMap<String, String>,
) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let name = match prefix {
                    Some(prefix) => format!("{prefix}.{key}"),
                    None => key.clone(),
                };
                flatten_parameters(Some(&name), value, out);
            }
        }
        serde_json::Value::Null => {}
        other => {
            if let Some(prefix) = prefix {
                out.insert(prefix.to_string(), crate::processors::scalar_to_string(other));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_path_placeholders() {
        let parameters = params(&[("id", "10"), ("user.name", "furion")]);
        assert_eq!(
            replace_path_placeholders("http://localhost/{id}/{user.name}/{missing}", &parameters),
            "http://localhost/10/furion/{missing}"
        );
        assert_eq!(replace_path_placeholders("/{ id }", &parameters), "/10");
    }

    #[test]
    fn test_path_placeholder_values_are_escaped() {
        let parameters = params(&[("file", "a/b"), ("query", "x?y=1#top"), ("name", "two words")]);
        assert_eq!(
            replace_path_placeholders("/files/{file}/{query}/{name}", &parameters),
            "/files/a%2Fb/x%3Fy%3D1%23top/two%20words"
        );
    }

    #[test]
    fn test_configuration_placeholders() {
        let lookup = params(&[("api:host", "example.com"), ("port", "8080")]);
        assert_eq!(
            replace_configuration_placeholders("http://[[api:host]]:[[port]]/", &lookup),
            "http://example.com:8080/"
        );
        assert_eq!(
            replace_configuration_placeholders("http://[[api:missing || localhost]]/", &lookup),
            "http://localhost/"
        );
        assert_eq!(
            replace_configuration_placeholders("http://[[nothing]]/", &lookup),
            "http://[[nothing]]/"
        );
    }

    #[test]
    fn test_flatten_parameters() {
        let mut out = HashMap::new();
        flatten_parameters(
            Some("user"),
            &json!({"id": 1, "address": {"city": "Paris"}, "tag": null}),
            &mut out,
        );
        assert_eq!(out.get("user.id").map(String::as_str), Some("1"));
        assert_eq!(out.get("user.address.city").map(String::as_str), Some("Paris"));
        assert!(!out.contains_key("user.tag"));

        let mut out = HashMap::new();
        flatten_parameters(None, &json!({"id": 10, "name": "furion"}), &mut out);
        assert_eq!(out.get("name").map(String::as_str), Some("furion"));
    }
}
