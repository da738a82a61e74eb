//! Variable name rules for scope contexts.

use std::sync::LazyLock;

use regex::Regex;

static VARIABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid name regex"));

/// True if `name` matches `[A-Za-z_][A-Za-z0-9_-]*`.
pub fn is_valid_variable_name(name: &str) -> bool {
    VARIABLE_NAME_RE.is_match(name)
}

/// Return the names in `names` that fail [`is_valid_variable_name`], in input order.
pub fn invalid_names<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    names
        .into_iter()
        .filter(|name| !is_valid_variable_name(name))
        .cloned()
        .collect()
}
