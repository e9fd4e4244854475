//! Job model and store.
//!
//! A job is the externally owned record of one dataset run. The worker
//! reads its status (for cancellation) and writes counters and terminal
//! state; everything else belongs to the control plane.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal status transitions. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Processing | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Processing => matches!(
                next,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            _ => false,
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRecord {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub owner_id: Uuid,
    pub model: String,
    pub template: String,

    #[builder(default = 10)]
    pub concurrency: i32,
    #[builder(default = 1500)]
    pub max_tokens: i32,
    #[builder(default, setter(strip_option))]
    pub max_units: Option<i32>,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default = 0)]
    pub total: i64,
    #[builder(default = 0)]
    pub processed: i64,
    #[builder(default = 0)]
    pub failed: i64,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, owner_id, model, template, concurrency, max_tokens, max_units, \
                           status, total, processed, failed, error_message, created_at, updated_at";

/// Store for job rows.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<JobRecord> {
        let job = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn insert(&self, job: &JobRecord) -> Result<JobRecord> {
        let inserted = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            INSERT INTO jobs (
                id, owner_id, model, template, concurrency, max_tokens, max_units,
                status, total, processed, failed, error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&job.model)
        .bind(&job.template)
        .bind(job.concurrency)
        .bind(job.max_tokens)
        .bind(job.max_units)
        .bind(job.status)
        .bind(job.total)
        .bind(job.processed)
        .bind(job.failed)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    /// Current status only; the worker polls this at flush time to
    /// observe cancellation.
    pub async fn status_of(&self, id: Uuid) -> Result<JobStatus> {
        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(status)
    }

    /// Record the unit total once it is known and move to processing.
    pub async fn start_processing(&self, id: Uuid, total: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing',
                total = $1,
                updated_at = NOW()
            WHERE id = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(total)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flush in-memory counters. `GREATEST` keeps the stored counters
    /// monotonic even if a retried task replays a prefix.
    pub async fn flush_counters(&self, id: Uuid, processed: i64, failed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET processed = GREATEST(processed, $1),
                failed = GREATEST(failed, $2),
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(processed)
        .bind(failed)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_completed(&self, id: Uuid, processed: i64, failed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                processed = GREATEST(processed, $1),
                failed = GREATEST(failed, $2),
                updated_at = NOW()
            WHERE id = $3 AND status = 'processing'
            "#,
        )
        .bind(processed)
        .bind(failed)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal failure with a sanitized message.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_message = $1,
                updated_at = NOW()
            WHERE id = $2 AND status NOT IN ('completed', 'cancelled')
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
