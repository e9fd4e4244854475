//! Unit and result records.
//!
//! A [`Unit`] is one input record; a [`RowResult`] is the unit extended
//! with the completion outcome. Both serialize flat: the system index
//! lives under `_idx` and the source fields sit at the top level, so the
//! checkpoint log and the final output read as plain JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use llm_client::Usage;

/// Key the parsed payload lands under when top-level merging is off.
pub const PARSED_KEY: &str = "parsed";

/// A single input record with its system-assigned ordinal.
///
/// `index` is the identity used everywhere downstream: checkpoint
/// deduplication, resume, and output ordering all key on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    #[serde(rename = "_idx")]
    pub index: u64,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Unit {
    pub fn new(index: u64, fields: Map<String, Value>) -> Self {
        Self { index, fields }
    }

    /// Look up a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Classification of a finished unit, derived from its result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Completion produced and (if enabled) parsed.
    Succeeded,
    /// Completion produced but the structured parse failed. Non-fatal.
    ParseFailed,
    /// Terminal per-unit failure (render error or LM failure).
    Failed,
}

/// The unit extended with its processing outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    #[serde(rename = "_idx")]
    pub index: u64,

    #[serde(flatten)]
    pub fields: Map<String, Value>,

    /// Raw completion text. Dropped on success unless raw retention is on;
    /// always kept when the parse failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Transient parse failure marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,

    /// Terminal failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// LM calls made for this unit.
    #[serde(rename = "_attempts", skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Set when the parse-retry budget ran out.
    #[serde(rename = "_retries_exhausted", skip_serializing_if = "Option::is_none")]
    pub retries_exhausted: Option<bool>,

    #[serde(rename = "_prompt_tokens", skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,

    #[serde(rename = "_completion_tokens", skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,

    #[serde(rename = "_cost_usd", skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl RowResult {
    /// A result carrying a raw completion, before post-processing.
    pub fn completed(unit: Unit, text: String, usage: Usage, attempts: u32) -> Self {
        Self {
            index: unit.index,
            fields: unit.fields,
            result: Some(text),
            parse_error: None,
            error: None,
            attempts: Some(attempts),
            retries_exhausted: None,
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
            cost_usd: Some(usage.cost_usd),
        }
    }

    /// A terminal per-unit failure.
    pub fn failed(unit: Unit, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            index: unit.index,
            fields: unit.fields,
            result: None,
            parse_error: None,
            error: Some(error.into()),
            attempts: if attempts > 0 { Some(attempts) } else { None },
            retries_exhausted: None,
            prompt_tokens: None,
            completion_tokens: None,
            cost_usd: None,
        }
    }

    pub fn outcome(&self) -> UnitOutcome {
        if self.error.is_some() {
            UnitOutcome::Failed
        } else if self.parse_error.is_some() {
            UnitOutcome::ParseFailed
        } else {
            UnitOutcome::Succeeded
        }
    }

    /// True when this record counts toward the processed-successfully total.
    pub fn is_success(&self) -> bool {
        self.outcome() == UnitOutcome::Succeeded
    }
}
