//! Extracting the predicted labels from a free-form classifier answer.

use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::label::label_from_json;
use crate::types::{Indicator, Prediction};

/// Turns raw classifier text into a [`Prediction`].
pub trait ResponseParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Prediction, TaskError>;
}

/// Takes the first brace-delimited object in the text, tolerating prose or
/// markdown fences around it. Braces inside JSON strings are not counted.
#[derive(Debug, Default, Clone)]
pub struct FirstObjectParser;

impl ResponseParser for FirstObjectParser {
    fn parse(&self, raw: &str) -> Result<Prediction, TaskError> {
        let candidate = first_object(raw.trim()).ok_or(TaskError::NoJsonObject)?;
        let object: Map<String, Value> = serde_json::from_str(candidate)
            .map_err(|e| TaskError::InvalidJson(e.to_string()))?;
        Ok(prediction_from_object(&object))
    }
}

/// Slice of `text` from the first `{` to its matching `}`.
pub fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn prediction_from_object(object: &Map<String, Value>) -> Prediction {
    let labels = Indicator::ALL
        .into_iter()
        .map(|indicator| {
            let label = match object.get(indicator.key()) {
                Some(value) => label_from_json(value),
                None => {
                    tracing::warn!(indicator = %indicator, "Indicator missing from classifier response");
                    None
                }
            };
            (indicator, label)
        })
        .collect();
    Prediction { labels }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"coating_label": "greasy", "tai_label": "white", "zhi_label": "regular", "fissure_label": "NaN", "tooth_mk_label": "light"}"#;

    #[test]
    fn parses_object_surrounded_by_prose() {
        let raw = format!("Here is my analysis:\n```json\n{FULL}\n```\nHope this helps.");
        let prediction = FirstObjectParser.parse(&raw).unwrap();
        assert_eq!(
            prediction.labels[&Indicator::CoatingLabel].as_deref(),
            Some("greasy")
        );
        assert_eq!(
            prediction.labels[&Indicator::ToothMkLabel].as_deref(),
            Some("light")
        );
    }

    #[test]
    fn no_object_is_a_parse_failure() {
        let err = FirstObjectParser
            .parse("The tongue looks greasy and white.")
            .unwrap_err();
        assert!(matches!(err, TaskError::NoJsonObject));
    }

    #[test]
    fn unterminated_object_is_a_parse_failure() {
        let err = FirstObjectParser.parse(r#"{"coating_label": "greasy""#).unwrap_err();
        assert!(matches!(err, TaskError::NoJsonObject));
    }

    #[test]
    fn malformed_object_is_invalid_json() {
        let err = FirstObjectParser.parse("{coating_label: greasy}").unwrap_err();
        assert!(matches!(err, TaskError::InvalidJson(_)));
    }

    #[test]
    fn missing_keys_become_none() {
        let prediction = FirstObjectParser
            .parse(r#"{"coating_label": "greasy", "tai_label": null}"#)
            .unwrap();
        assert_eq!(prediction.labels.len(), 5);
        assert_eq!(prediction.labels[&Indicator::TaiLabel], None);
        assert_eq!(prediction.labels[&Indicator::FissureLabel], None);
    }

    #[test]
    fn first_object_wins_and_ignores_braces_in_strings() {
        let text = r#"a {"k": "}{", "n": {"x": 1}} b {"other": 2}"#;
        assert_eq!(first_object(text), Some(r#"{"k": "}{", "n": {"x": 1}}"#));
        assert_eq!(first_object("no braces"), None);
        assert_eq!(first_object(r#"{"q": "\"}"}"#), Some(r#"{"q": "\"}"}"#));
    }
}
