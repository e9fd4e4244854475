//! Error types for the completion client.

use std::time::Duration;

use thiserror::Error;

/// Result type for completion operations.
pub type Result<T> = std::result::Result<T, CompletionError>;

/// Completion client errors.
///
/// The taxonomy is what retry and circuit-breaker logic dispatch on:
/// fatal errors surface immediately, retryable errors are retried inside
/// the client up to the attempt budget.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    /// Authentication rejected (invalid or missing API key). Fatal.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Authorization denied (key lacks access to the model). Fatal.
    #[error("authorization denied: {0}")]
    Forbidden(String),

    /// Malformed request (bad model name, invalid parameters). Fatal.
    #[error("malformed request: {0}")]
    InvalidRequest(String),

    /// Provider rate limit hit. Retryable.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Single request exceeded its timeout. Retryable.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transient provider-side failure (5xx). Retryable.
    #[error("server error: {0}")]
    ServerError(String),

    /// Transport-level failure (connection refused, DNS, TLS). Retryable.
    #[error("network error: {0}")]
    Network(String),
}

impl CompletionError {
    /// Whether the client should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited(_)
                | CompletionError::Timeout(_)
                | CompletionError::ServerError(_)
                | CompletionError::Network(_)
        )
    }

    /// Whether this error is fatal (no retry, breaker-counted).
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}
