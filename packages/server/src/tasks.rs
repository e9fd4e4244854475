//! Task model for the worker queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use batch_core::{EngineConfig, EngineMode};
use llm_client::CompletionParams;

pub const DEFAULT_QUEUE: &str = "batch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

/// Whether a task failure should be retried by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient: requeue while attempts remain, then dead-letter.
    Retryable,
    /// Permanent: the task moves straight to failed.
    NonRetryable,
    /// Interrupted by graceful shutdown; always requeued like retryable.
    Shutdown,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable | FailureKind::Shutdown)
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub queue: String,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Deserialize the task payload.
    pub fn payload(&self) -> anyhow::Result<TaskPayload> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Worker-side defaults applied where a job record leaves a knob unset.
#[derive(Debug, Clone)]
pub struct PayloadDefaults {
    pub concurrency: usize,
    pub max_retries: u32,
    pub request_timeout: std::time::Duration,
    pub breaker_threshold: u32,
}

impl From<&crate::config::Config> for PayloadDefaults {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            concurrency: config.concurrency_default,
            max_retries: config.max_retries_default,
            request_timeout: config.request_timeout_default,
            breaker_threshold: config.circuit_breaker_default,
        }
    }
}

/// Everything a worker needs to run one job, carried on the task row.
///
/// `credential` is the owner's API key sealed with the payload key; it
/// never appears in the clear outside the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub template: String,
    pub params: CompletionParams,
    pub engine: EngineConfig,
    /// The job's declared unit bound, enforced at admission.
    #[serde(default)]
    pub max_units: Option<i64>,
    /// Blob-store key of the staged input dataset.
    pub input_key: String,
    /// Blob-store key the final output is uploaded under.
    pub output_key: String,
    /// Sealed API key (base64, AES-256-GCM).
    pub credential: String,
}

impl TaskPayload {
    /// Build the payload for a job, filling the engine and client knobs
    /// from the job record plus worker defaults.
    pub fn for_job(
        job: &crate::jobs::JobRecord,
        credential: String,
        input_key: impl Into<String>,
        output_key: impl Into<String>,
        defaults: &PayloadDefaults,
    ) -> Self {
        let concurrency = if job.concurrency > 0 {
            job.concurrency as usize
        } else {
            defaults.concurrency
        };
        let mode = if concurrency > 1 {
            EngineMode::Parallel
        } else {
            EngineMode::Sequential
        };

        let params = CompletionParams::new(job.model.clone())
            .max_tokens(job.max_tokens.max(1) as u32)
            .timeout(defaults.request_timeout)
            .max_retries(defaults.max_retries);

        Self {
            job_id: job.id,
            owner_id: job.owner_id,
            template: job.template.clone(),
            params,
            engine: EngineConfig {
                mode,
                concurrency,
                breaker_threshold: defaults.breaker_threshold,
                ..Default::default()
            },
            max_units: job.max_units.map(i64::from),
            input_key: input_key.into(),
            output_key: output_key.into(),
            credential,
        }
    }
}
