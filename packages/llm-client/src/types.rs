//! Request parameters and wire types for the chat completions API.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default completion token ceiling.
pub const DEFAULT_MAX_TOKENS: u32 = 1500;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default total attempt budget (initial request counted).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Tunables for a single completion call.
///
/// Every knob is an explicit field; there is no keyword-argument escape
/// hatch. Unknown settings are a compile error at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Model name, e.g. `gpt-4o-mini`.
    pub model: String,

    /// Maximum completion tokens.
    pub max_tokens: u32,

    /// Sampling temperature. `None` uses the provider default.
    pub temperature: Option<f32>,

    /// Per-request timeout. Exceeding it is a retryable error.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Total attempts for retryable errors (the first request counts).
    pub max_retries: u32,
}

impl CompletionParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Token counts and computed cost for one successful completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Dollar cost derived from the pricing table; 0 when unpriced.
    pub cost_usd: f64,
    /// False when the model was missing from the pricing table.
    pub priced: bool,
}

/// A successful completion: the text plus its usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Wire types (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponseRaw {
    pub choices: Vec<WireChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireResponseMessage {
    pub content: String,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
pub(crate) struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_defaults() {
        let params = CompletionParams::new("gpt-4o-mini");
        assert_eq!(params.max_tokens, 1500);
        assert_eq!(params.timeout, Duration::from_secs(120));
        assert_eq!(params.max_retries, 3);
        assert!(params.temperature.is_none());
    }

    #[test]
    fn params_round_trip_through_json() {
        let params = CompletionParams::new("gpt-4o")
            .max_tokens(256)
            .temperature(0.2)
            .timeout(Duration::from_secs(30));

        let json = serde_json::to_string(&params).unwrap();
        let back: CompletionParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model, "gpt-4o");
        assert_eq!(back.max_tokens, 256);
        assert_eq!(back.timeout, Duration::from_secs(30));
    }

    #[test]
    fn response_parses_without_usage() {
        let raw = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
        let parsed: ChatResponseRaw = serde_json::from_str(raw).unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content, "hi");
    }
}
