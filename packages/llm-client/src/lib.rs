//! LM completion client.
//!
//! A minimal client for OpenAI-compatible chat completion APIs with no
//! domain-specific logic. Classifies provider errors into fatal vs
//! retryable, retries the retryable ones with jittered exponential
//! backoff, honors per-request timeouts, and returns usage/cost metadata
//! alongside the completion text.
//!
//! # Example
//!
//! ```rust,ignore
//! use llm_client::{CompletionClient, CompletionParams, HttpCompletionClient};
//!
//! let client = HttpCompletionClient::from_env()?;
//! let params = CompletionParams::new("gpt-4o-mini").max_tokens(512);
//!
//! let completion = client.complete("Say hello.", &params).await?;
//! println!("{} (${:.6})", completion.text, completion.usage.cost_usd);
//! ```

pub mod error;
pub mod pricing;
pub mod retry;
pub mod types;

pub use error::{CompletionError, Result};
pub use pricing::{ModelRate, PricingTable};
pub use retry::RetryPolicy;
pub use types::{Completion, CompletionParams, Usage};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use types::{ChatRequest, ChatResponseRaw, WireMessage};

/// The single entry point for completion calls.
///
/// Implementations must be safe to share across concurrent units: no
/// per-call state lives on the client. `complete` is the cooperative
/// entry point — it suspends on the ambient runtime and never creates
/// one of its own.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<Completion>;
}

/// HTTP client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct HttpCompletionClient {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    pricing: PricingTable,
    retry: RetryPolicy,
}

impl HttpCompletionClient {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            pricing: PricingTable::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create from the `LLM_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| CompletionError::AuthRejected("LLM_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (proxies, Azure, local stubs).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Replace the pricing table.
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Replace the retry backoff schedule.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Blocking variant of [`CompletionClient::complete`] with identical
    /// semantics, for callers without an async runtime.
    ///
    /// Builds a private current-thread runtime per call. Must not be
    /// called from within a tokio runtime; use `complete` there instead.
    pub fn complete_blocking(&self, prompt: &str, params: &CompletionParams) -> Result<Completion> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CompletionError::Network(format!("failed to build runtime: {e}")))?;
        runtime.block_on(self.complete(prompt, params))
    }

    /// One request, no retries.
    async fn request_once(&self, prompt: &str, params: &CompletionParams) -> Result<Completion> {
        let request = ChatRequest {
            model: &params.model,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(params.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(params.timeout)
                } else {
                    CompletionError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let raw: ChatResponseRaw = response.json().await.map_err(|e| {
            CompletionError::ServerError(format!("undecodable completion response: {e}"))
        })?;

        let wire_usage = raw.usage.unwrap_or_default();
        let text = raw
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CompletionError::ServerError("response carried no choices".into()))?;

        let usage = self.pricing.usage(
            &params.model,
            wire_usage.prompt_tokens,
            wire_usage.completion_tokens,
        );

        debug!(
            model = %params.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion succeeded"
        );

        Ok(Completion { text, usage })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<Completion> {
        let attempts = params.max_retries.max(1);

        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.request_once(prompt, params).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable completion error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Loop always returns inside; this covers attempts == 0 clamping.
        Err(last_err.unwrap_or_else(|| CompletionError::ServerError("no attempts made".into())))
    }
}

fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.chars().take(300).collect::<String>())
    };

    match status {
        StatusCode::UNAUTHORIZED => CompletionError::AuthRejected(detail),
        StatusCode::FORBIDDEN => CompletionError::Forbidden(detail),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            CompletionError::InvalidRequest(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT => CompletionError::Timeout(types::DEFAULT_TIMEOUT),
        s if s.is_server_error() => CompletionError::ServerError(detail),
        _ => CompletionError::InvalidRequest(detail),
    }
}
