//! Completion post-processing.
//!
//! Locates a JSON payload inside raw completion text: a fenced code block
//! first, then the whole text, then the first balanced brace/bracket
//! region. On success the payload is merged into the result (or nested
//! under a dedicated key); on failure the result is tagged with a
//! `parse_error` and the raw text is retained.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::types::{RowResult, PARSED_KEY};

lazy_static! {
    static ref FENCE_REGEX: Regex = Regex::new(r"(?s)```(?:json)?\s*(.+?)\s*```").unwrap();
}

/// Post-processing switches.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PostProcessOptions {
    /// Attempt structured parsing at all.
    pub enabled: bool,
    /// Merge top-level keys of a parsed object into the result.
    pub merge: bool,
    /// Keep the raw completion text on successful parses.
    pub include_raw: bool,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            merge: true,
            include_raw: false,
        }
    }
}

/// Try to pull a JSON value out of completion text.
pub fn extract_json(text: &str) -> Result<Value, String> {
    if let Some(caps) = FENCE_REGEX.captures(text) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Ok(value);
        }
    }

    let trimmed = text.trim();
    let whole_err = match serde_json::from_str(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(region) = balanced_region(trimmed) {
        if let Ok(value) = serde_json::from_str(region) {
            return Ok(value);
        }
    }

    Err(whole_err.to_string())
}

/// First balanced `{...}` or `[...]` region, string-aware.
fn balanced_region(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
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

/// Apply post-processing to a completed result in place.
///
/// No-op when disabled or when the result carries no raw text (terminal
/// failures never reach here with a payload to parse).
pub fn process(result: &mut RowResult, options: &PostProcessOptions) {
    if !options.enabled {
        return;
    }
    let Some(raw) = result.result.clone() else {
        return;
    };

    match extract_json(&raw) {
        Ok(value) => {
            result.parse_error = None;
            match value {
                Value::Object(object) if options.merge => {
                    for (key, val) in object {
                        result.fields.insert(key, val);
                    }
                }
                other => {
                    result.fields.insert(PARSED_KEY.to_string(), other);
                }
            }
            if !options.include_raw {
                result.result = None;
            }
        }
        Err(reason) => {
            // Raw text is kept regardless of include_raw so the failure
            // can be inspected and retried.
            result.parse_error = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Unit;
    use llm_client::Usage;
    use serde_json::{json, Map};

    fn completed(text: &str) -> RowResult {
        let mut fields = Map::new();
        fields.insert("text".into(), json!("hello"));
        RowResult::completed(Unit::new(0, fields), text.into(), Usage::default(), 1)
    }

    #[test]
    fn parses_fenced_block() {
        let value = extract_json("Here you go:\n```json\n{\"es\": \"hola\"}\n```").unwrap();
        assert_eq!(value, json!({"es": "hola"}));
    }

    #[test]
    fn parses_bare_json() {
        let value = extract_json(r#"{"es": "hola"}"#).unwrap();
        assert_eq!(value, json!({"es": "hola"}));
    }

    #[test]
    fn parses_first_balanced_region() {
        let value = extract_json(r#"Sure! The answer is {"es": "hola"} — enjoy."#).unwrap();
        assert_eq!(value, json!({"es": "hola"}));
    }

    #[test]
    fn balanced_region_ignores_braces_inside_strings() {
        let value = extract_json(r#"prefix {"a": "b } c"} suffix"#).unwrap();
        assert_eq!(value, json!({"a": "b } c"}));
    }

    #[test]
    fn arrays_are_extracted_too() {
        let value = extract_json("answer: [1, 2, 3]").unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn unparseable_text_reports_reason() {
        assert!(extract_json("no json here at all").is_err());
    }

    #[test]
    fn merge_lifts_keys_to_top_level_and_drops_raw() {
        let mut result = completed(r#"{"es": "hola"}"#);
        process(&mut result, &PostProcessOptions::default());
        assert_eq!(result.fields["es"], json!("hola"));
        assert_eq!(result.fields["text"], json!("hello"));
        assert!(result.result.is_none());
        assert!(result.parse_error.is_none());
    }

    #[test]
    fn no_merge_nests_under_parsed() {
        let mut result = completed(r#"{"es": "hola"}"#);
        let options = PostProcessOptions {
            merge: false,
            ..Default::default()
        };
        process(&mut result, &options);
        assert_eq!(result.fields[PARSED_KEY], json!({"es": "hola"}));
        assert!(result.fields.get("es").is_none());
    }

    #[test]
    fn include_raw_keeps_completion_text() {
        let mut result = completed(r#"{"es": "hola"}"#);
        let options = PostProcessOptions {
            include_raw: true,
            ..Default::default()
        };
        process(&mut result, &options);
        assert_eq!(result.result.as_deref(), Some(r#"{"es": "hola"}"#));
    }

    #[test]
    fn parse_failure_keeps_raw_and_tags_result() {
        let mut result = completed("definitely not json");
        process(&mut result, &PostProcessOptions::default());
        assert!(result.parse_error.is_some());
        assert_eq!(result.result.as_deref(), Some("definitely not json"));
    }

    #[test]
    fn non_object_payload_nests_even_when_merging() {
        let mut result = completed("[1, 2]");
        process(&mut result, &PostProcessOptions::default());
        assert_eq!(result.fields[PARSED_KEY], json!([1, 2]));
    }

    #[test]
    fn disabled_processing_is_a_no_op() {
        let mut result = completed("{\"es\": \"hola\"}");
        let options = PostProcessOptions {
            enabled: false,
            ..Default::default()
        };
        process(&mut result, &options);
        assert_eq!(result.result.as_deref(), Some("{\"es\": \"hola\"}"));
        assert!(result.fields.get("es").is_none());
    }
}
