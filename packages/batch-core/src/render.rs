//! Prompt rendering.
//!
//! Fills `{name}` placeholders from a unit's fields. Before substitution,
//! every interpolated value is scanned for instruction-override phrasing
//! and matches are replaced with a redaction marker. The scan is a
//! defense-in-depth heuristic, not a security boundary.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::types::Unit;

/// Replacement for scrubbed injection attempts.
pub const REDACTION_MARKER: &str = "[FILTERED]";

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    // Common attempts to override upstream instructions. Case-insensitive;
    // false negatives are acceptable, false positives cost a marker.
    static ref INJECTION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)ignore\s+(?:all\s+|any\s+)?(?:previous|prior|above|earlier)\s+instructions").unwrap(),
        Regex::new(r"(?i)disregard\s+(?:all\s+|any\s+)?(?:previous|prior|the)\s+(?:instructions|above|prompt)").unwrap(),
        Regex::new(r"(?i)forget\s+(?:all\s+|everything\s+)?(?:previous|prior|above)").unwrap(),
        Regex::new(r"(?i)you\s+are\s+now\s+(?:a|an|the)\b").unwrap(),
        Regex::new(r"(?im)^\s*system\s*:").unwrap(),
        Regex::new(r"(?i)new\s+instructions?\s*:").unwrap(),
        Regex::new(r"(?i)override\s+(?:the\s+)?(?:system|previous)\s+prompt").unwrap(),
        Regex::new(r"(?i)act\s+as\s+if\s+you\s+(?:have\s+no|had\s+no)\s+(?:instructions|rules)").unwrap(),
    ];
}

/// A placeholder named a field the unit does not carry.
///
/// Terminal per-unit failure; the unit never reaches the LM.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("template field `{field}` missing from unit {index}")]
pub struct RenderError {
    pub field: String,
    pub index: u64,
}

/// The set of placeholder names a template requires.
pub fn required_fields(template: &str) -> BTreeSet<String> {
    PLACEHOLDER_REGEX
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Replace instruction-override phrasing with the redaction marker.
pub fn scrub_injection(value: &str) -> String {
    let mut scrubbed = value.to_string();
    for pattern in INJECTION_PATTERNS.iter() {
        scrubbed = pattern.replace_all(&scrubbed, REDACTION_MARKER).into_owned();
    }
    scrubbed
}

/// Render a template against a unit.
///
/// Scalars substitute as their canonical text, structured values as
/// compact JSON. The first missing field aborts the render.
pub fn render(template: &str, unit: &Unit) -> Result<String, RenderError> {
    for field in required_fields(template) {
        if unit.get(&field).is_none() {
            return Err(RenderError {
                field,
                index: unit.index,
            });
        }
    }

    let rendered = PLACEHOLDER_REGEX.replace_all(template, |caps: &regex::Captures<'_>| {
        // Presence was checked above.
        let value = unit.get(&caps[1]).cloned().unwrap_or(Value::Null);
        scrub_injection(&coerce(&value))
    });

    Ok(rendered.into_owned())
}

fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
