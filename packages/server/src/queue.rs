//! PostgreSQL-backed task queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so no two workers can lease the
//! same task. Leases are kept alive by heartbeats; a sweeper returns
//! tasks with stale heartbeats to pending, dead-lettering them once the
//! attempt budget is spent.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::tasks::{FailureKind, TaskPayload, TaskPriority, TaskRecord};

/// Result of an enqueue that accounts for idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Task was inserted; returns the new task ID.
    Created(Uuid),
    /// A live task with the same idempotency key exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn task_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

const TASK_COLUMNS: &str = "id, queue, status, payload, priority, scheduled_at, claimed_by, \
                            claimed_at, started_at, completed_at, last_heartbeat, attempts, \
                            max_attempts, last_error, idempotency_key, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresTaskQueue {
    pool: PgPool,
    queue: String,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    /// Enqueue a task. With an idempotency key, a matching live task
    /// short-circuits to `Duplicate`.
    pub async fn enqueue(
        &self,
        payload: &TaskPayload,
        priority: TaskPriority,
        max_attempts: i32,
        idempotency_key: Option<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueResult> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.find_live_by_idempotency_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, queue, payload, priority, scheduled_at, max_attempts, idempotency_key)
            VALUES ($1, $2, $3, $4, COALESCE($5, NOW()), $6, $7)
            "#,
        )
        .bind(id)
        .bind(&self.queue)
        .bind(serde_json::to_value(payload)?)
        .bind(priority)
        .bind(scheduled_at)
        .bind(max_attempts)
        .bind(&idempotency_key)
        .execute(&self.pool)
        .await?;

        info!(task_id = %id, job_id = %payload.job_id, "task enqueued");
        Ok(EnqueueResult::Created(id))
    }

    async fn find_live_by_idempotency_key(&self, key: &str) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM tasks
            WHERE idempotency_key = $1
              AND status IN ('pending', 'claimed', 'running')
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    /// Lease the oldest ready task, if any.
    ///
    /// Ready means pending with its scheduled time arrived; order is
    /// priority first, then scheduled time.
    pub async fn claim_one(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        let task = sqlx::query_as::<_, TaskRecord>(&format!(
            r#"
            WITH next_task AS (
                SELECT id
                FROM tasks
                WHERE queue = $1
                  AND status = 'pending'
                  AND scheduled_at <= NOW()
                ORDER BY priority, scheduled_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET status = 'claimed',
                claimed_by = $2,
                claimed_at = NOW(),
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_task)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&self.queue)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    /// Move a claimed task to running once execution begins.
    pub async fn start(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Refresh the lease for a claimed or running task.
    pub async fn heartbeat(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('claimed', 'running')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_completed(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failure. Retryable failures requeue with backoff while
    /// attempts remain; exhausted retryables dead-letter; permanent
    /// failures go straight to failed.
    pub async fn mark_failed(&self, task_id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let task = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;

        if kind.should_retry() && task.attempts + 1 < task.max_attempts {
            let delay_secs = 2i64.pow(task.attempts.max(0) as u32).min(3600);
            let retry_at = Utc::now() + ChronoDuration::seconds(delay_secs);

            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'pending',
                    attempts = attempts + 1,
                    scheduled_at = $1,
                    claimed_by = NULL,
                    claimed_at = NULL,
                    last_heartbeat = NULL,
                    last_error = $2,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

            warn!(task_id = %task_id, retry_at = %retry_at, error = %error, "task requeued for retry");
        } else if kind.should_retry() {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'dead_letter',
                    attempts = attempts + 1,
                    completed_at = NOW(),
                    last_error = $1,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

            warn!(task_id = %task_id, error = %error, "task dead-lettered, retries exhausted");
        } else {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'failed',
                    attempts = attempts + 1,
                    completed_at = NOW(),
                    last_error = $1,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

            warn!(task_id = %task_id, error = %error, "task failed");
        }

        Ok(())
    }

    /// Return stuck tasks to pending.
    ///
    /// A task is stuck when it is claimed or running and its heartbeat
    /// is older than `stale_after`. Attempts increment on recovery; a
    /// task past its attempt budget dead-letters instead.
    pub async fn recover_stuck(&self, stale_after: std::time::Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::minutes(30));

        let recovered = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE tasks
            SET status = CASE
                    WHEN attempts + 1 >= max_attempts THEN 'dead_letter'::task_status
                    ELSE 'pending'::task_status
                END,
                attempts = attempts + 1,
                claimed_by = NULL,
                claimed_at = NULL,
                last_heartbeat = NULL,
                last_error = COALESCE(last_error, 'worker lost: heartbeat expired'),
                updated_at = NOW()
            WHERE queue = $1
              AND status IN ('claimed', 'running')
              AND last_heartbeat < $2
            RETURNING id
            "#,
        )
        .bind(&self.queue)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered stuck tasks");
        }
        Ok(recovered)
    }
}
