//! Canonical form for label values.
//!
//! Ground truth comes from a spreadsheet export where empty cells, `nan` and
//! `None` all mean "feature absent"; the classifier answers `NaN`, `null` or
//! omits the key. All of them collapse to [`MISSING_LABEL`].

use serde_json::Value;

pub const MISSING_LABEL: &str = "NaN";

const MISSING_ALIASES: [&str; 3] = ["nan", "none", "null"];

/// Normalize an optional label. Idempotent.
pub fn normalize(value: Option<&str>) -> String {
    match value {
        None => MISSING_LABEL.to_string(),
        Some(label) if is_missing(label) => MISSING_LABEL.to_string(),
        Some(label) => label.to_string(),
    }
}

fn is_missing(label: &str) -> bool {
    MISSING_ALIASES
        .iter()
        .any(|alias| label.eq_ignore_ascii_case(alias))
}

/// String form of a JSON value as it appears in a classifier response.
/// `null` maps to `None`; strings are taken verbatim; booleans become
/// `True`/`False` to match labels exported by the annotation tooling;
/// anything else uses its JSON text.
pub fn label_from_json(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("True".to_string()),
        Value::Bool(false) => Some("False".to_string()),
        other => Some(other.to_string()),
    }
}
