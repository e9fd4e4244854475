//! Run options and the TOML parameter file.
//!
//! Flags win over the file; the file wins over defaults. The file
//! recognizes the same names as the long flags.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use batch_core::{EngineConfig, EngineMode, PostProcessOptions};
use llm_client::CompletionParams;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_TOKENS: u32 = 1500;
pub const DEFAULT_CIRCUIT_BREAKER: u32 = 5;

/// Parameter document loaded with `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileParams {
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub batch_size: Option<usize>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub preview: Option<usize>,
    pub checkin_interval: Option<u64>,
    pub circuit_breaker: Option<u32>,
    pub parse_retries: Option<u32>,
    pub post_process: Option<bool>,
    pub merge: Option<bool>,
    pub include_raw: Option<bool>,
}

impl FileParams {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// Fully resolved options for one `process` run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub template: String,
    pub params: CompletionParams,
    pub engine: EngineConfig,
    pub preview: usize,
    pub checkin_interval: u64,
    pub seed: Option<u64>,
}

pub struct ProcessFlags {
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub batch_size: Option<usize>,
    pub max_tokens: Option<u32>,
    pub preview: Option<usize>,
    pub checkin_interval: Option<u64>,
    pub circuit_breaker: Option<u32>,
    pub no_post_process: bool,
    pub no_merge: bool,
    pub include_raw: bool,
    pub seed: Option<u64>,
}

pub fn resolve(flags: ProcessFlags, file: FileParams) -> Result<RunOptions> {
    let Some(template) = flags.prompt.or(file.prompt) else {
        bail!("a prompt template is required (--prompt or --config)");
    };

    let mode = match flags
        .mode
        .or(file.mode)
        .unwrap_or_else(|| "sequential".to_string())
        .as_str()
    {
        "sequential" => EngineMode::Sequential,
        "async" => EngineMode::Parallel,
        other => bail!("unknown mode `{other}` (expected sequential or async)"),
    };

    let model = flags
        .model
        .or(file.model)
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let max_tokens = flags
        .max_tokens
        .or(file.max_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut params = CompletionParams::new(model).max_tokens(max_tokens);
    if let Some(secs) = file.timeout_secs {
        params = params.timeout(Duration::from_secs(secs));
    }

    let post_process = PostProcessOptions {
        enabled: !flags.no_post_process && file.post_process.unwrap_or(true),
        merge: !flags.no_merge && file.merge.unwrap_or(true),
        include_raw: flags.include_raw || file.include_raw.unwrap_or(false),
    };

    let engine = EngineConfig {
        mode,
        concurrency: flags
            .batch_size
            .or(file.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE),
        parse_retries: file.parse_retries.unwrap_or(2),
        breaker_threshold: flags
            .circuit_breaker
            .or(file.circuit_breaker)
            .unwrap_or(DEFAULT_CIRCUIT_BREAKER),
        post_process,
    };

    Ok(RunOptions {
        template,
        params,
        engine,
        preview: flags.preview.or(file.preview).unwrap_or(0),
        checkin_interval: flags.checkin_interval.or(file.checkin_interval).unwrap_or(0),
        seed: flags.seed,
    })
}
