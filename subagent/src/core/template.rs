//! `{{name}}` placeholder scanning and substitution.
//!
//! Substitution is lenient: placeholders that cannot be resolved (unknown or
//! syntactically invalid names) are left in the output verbatim and reported
//! back to the caller, which decides how loudly to complain.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::naming::is_valid_variable_name;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("valid placeholder regex"));

/// Result of substituting placeholders in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Valid names with no value, in first-seen order, deduplicated.
    pub missing: Vec<String>,
    /// Placeholder bodies that are not valid variable names.
    pub invalid: Vec<String>,
}

impl Rendered {
    pub fn unresolved(&self) -> Vec<String> {
        self.missing
            .iter()
            .chain(self.invalid.iter())
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

/// Placeholder names found in `template`, in order of appearance (with repeats).
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitute every `{{name}}` using `lookup`.
pub fn render<F>(template: &str, mut lookup: F) -> Rendered
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    let text = PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            if !is_valid_variable_name(name) {
                push_unique(&mut invalid, name);
                return caps[0].to_string();
            }
            match lookup(name) {
                Some(value) => value_to_text(&value),
                None => {
                    push_unique(&mut missing, name);
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    Rendered {
        text,
        missing,
        invalid,
    }
}

/// String form of a variable value for prompt text.
///
/// Strings are inserted raw; objects and arrays are serialized as JSON rather
/// than flattened.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}
