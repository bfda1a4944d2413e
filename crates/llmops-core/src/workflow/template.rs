//! `{{name}}` placeholder rendering shared by the llm and
//! template-transform nodes.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static regex")
});

/// Text form of a variable value: strings verbatim, null as empty,
/// everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace each `{{name}}` with the matching variable. Unknown names
/// render as the empty string.
pub fn render(template: &str, vars: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1]).map(value_to_text).unwrap_or_default()
        })
        .into_owned()
}
