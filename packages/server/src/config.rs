//! Worker configuration loaded from environment variables.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Base64-encoded 32-byte key for opening sealed task credentials.
    pub payload_key: String,
    /// Override for the LM provider base URL (proxies, local stubs).
    pub llm_base_url: Option<String>,

    pub concurrency_default: usize,
    pub stuck_task_timeout: Duration,
    pub max_retries_default: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter: Duration,
    pub request_timeout_default: Duration,
    pub circuit_breaker_default: u32,

    pub allowed_models: HashSet<String>,
    pub monthly_budget_enforcement: bool,
    pub monthly_budget_usd: f64,
    pub content_moderation: bool,
    /// Global ceiling on units per job; a job's own `max_units` can only
    /// tighten it.
    pub max_units_limit: i64,

    /// Root for per-job checkpoint directories.
    pub checkpoint_root: String,
    /// Root for staged job input/output files.
    pub storage_root: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            payload_key: env::var("PAYLOAD_KEY").context("PAYLOAD_KEY must be set")?,
            llm_base_url: env::var("LLM_BASE_URL").ok(),

            concurrency_default: parse_var("WORKER_CONCURRENCY_DEFAULT", 10)?,
            stuck_task_timeout: Duration::from_secs(parse_var("STUCK_TASK_TIMEOUT_SECS", 1800)?),
            max_retries_default: parse_var("MAX_RETRIES_DEFAULT", 3)?,
            retry_base_delay: Duration::from_secs(parse_var("RETRY_BASE_DELAY_SECS", 1)?),
            retry_max_delay: Duration::from_secs(parse_var("RETRY_MAX_DELAY_SECS", 60)?),
            retry_jitter: Duration::from_secs(parse_var("RETRY_JITTER_SECS", 5)?),
            request_timeout_default: Duration::from_secs(parse_var(
                "REQUEST_TIMEOUT_SECS",
                120,
            )?),
            circuit_breaker_default: parse_var("CIRCUIT_BREAKER_DEFAULT", 5)?,

            allowed_models: parse_list(
                &env::var("ALLOWED_MODELS")
                    .unwrap_or_else(|_| "gpt-4o-mini,gpt-4o,gpt-4.1-mini".to_string()),
            ),
            monthly_budget_enforcement: parse_var("MONTHLY_BUDGET_ENFORCEMENT", true)?,
            monthly_budget_usd: parse_var("MONTHLY_BUDGET_USD", 100.0)?,
            content_moderation: parse_var("CONTENT_MODERATION", true)?,
            max_units_limit: parse_var("MAX_UNITS_LIMIT", 100_000)?,

            checkpoint_root: env::var("CHECKPOINT_ROOT")
                .unwrap_or_else(|_| "/var/lib/batchline/checkpoints".to_string()),
            storage_root: env::var("STORAGE_ROOT")
                .unwrap_or_else(|_| "/var/lib/batchline/storage".to_string()),
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid value")),
        Err(_) => Ok(default),
    }
}

fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_trims_and_skips_empties() {
        let models = parse_list("gpt-4o, gpt-4o-mini,, ");
        assert_eq!(models.len(), 2);
        assert!(models.contains("gpt-4o"));
        assert!(models.contains("gpt-4o-mini"));
    }
}
