//! Worker loop for processing queued tasks.
//!
//! The `TaskWorker` is a long-running service that:
//! - Polls the queue for ready tasks, leasing one at a time
//! - Runs each task against the processing engine via `TaskRunner`
//! - Keeps the lease alive with periodic heartbeats
//! - Sweeps stuck tasks whose workers died without a terminal state
//! - Drains gracefully on shutdown
//!
//! # Architecture
//!
//! ```text
//! TaskWorker
//!     │
//!     ├─► claim_one (FOR UPDATE SKIP LOCKED)
//!     ├─► heartbeat task (interval, cancelled on completion)
//!     ├─► TaskRunner::run_task (engine + checkpoint + job store)
//!     └─► mark_completed / mark_failed (queue handles retry budget)
//! ```
//!
//! One task is processed at a time per worker; fleet throughput comes
//! from running more worker processes, each claiming with row locks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::PostgresTaskQueue;
use crate::runner::TaskRunner;
use crate::tasks::TaskRecord;

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Sleep after an empty poll starts here...
    pub min_poll_interval: Duration,
    /// ...and doubles up to here while the queue stays empty.
    pub max_poll_interval: Duration,
    /// How often to refresh the lease on the running task.
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this mark a task as stuck.
    pub stuck_threshold: Duration,
    /// Worker ID recorded on claims.
    pub worker_id: String,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(1800),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl TaskWorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

pub struct TaskWorker {
    queue: Arc<PostgresTaskQueue>,
    runner: Arc<TaskRunner>,
    config: TaskWorkerConfig,
}

impl TaskWorker {
    pub fn new(queue: Arc<PostgresTaskQueue>, runner: Arc<TaskRunner>) -> Self {
        Self {
            queue,
            runner,
            config: TaskWorkerConfig::default(),
        }
    }

    pub fn with_config(
        queue: Arc<PostgresTaskQueue>,
        runner: Arc<TaskRunner>,
        config: TaskWorkerConfig,
    ) -> Self {
        Self {
            queue,
            runner,
            config,
        }
    }

    /// Run until `shutdown` fires. In-flight work is allowed to finish:
    /// the runner observes the token and stops at its next suspension
    /// point, leaving a valid checkpoint behind.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "task worker starting");

        // Sweeper shares the process; half the stuck threshold keeps
        // recovery latency under one threshold.
        let sweeper = tokio::spawn(sweep_loop(
            self.queue.clone(),
            self.config.stuck_threshold,
            shutdown.clone(),
        ));

        let mut poll_interval = self.config.min_poll_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let task = match self.queue.claim_one(&self.config.worker_id).await {
                Ok(task) => task,
                Err(e) => {
                    error!(error = %e, "failed to claim a task");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let Some(task) = task else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                poll_interval = (poll_interval * 2).min(self.config.max_poll_interval);
                continue;
            };

            poll_interval = self.config.min_poll_interval;
            self.process_task(task, &shutdown).await;
        }

        let _ = sweeper.await;
        info!(worker_id = %self.config.worker_id, "task worker stopped");
        Ok(())
    }

    async fn process_task(&self, task: TaskRecord, shutdown: &CancellationToken) {
        let task_id = task.id;
        debug!(task_id = %task_id, attempts = task.attempts, "task claimed");

        if let Err(e) = self.queue.start(task_id).await {
            error!(task_id = %task_id, error = %e, "failed to mark task running");
            return;
        }

        // Heartbeat until the task settles.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            task_id,
            self.config.heartbeat_interval,
            heartbeat_stop.clone(),
        ));

        let result = self.runner.run_task(&task, shutdown.clone()).await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match result {
            Ok(()) => {
                debug!(task_id = %task_id, "task succeeded");
                if let Err(e) = self.queue.mark_completed(task_id).await {
                    error!(task_id = %task_id, error = %e, "failed to mark task completed");
                }
            }
            Err(task_error) => {
                warn!(task_id = %task_id, error = %task_error, "task failed");
                if let Err(e) = self
                    .queue
                    .mark_failed(task_id, &task_error.message, task_error.kind)
                    .await
                {
                    error!(task_id = %task_id, error = %e, "failed to mark task failed");
                }
            }
        }
    }
}

async fn heartbeat_loop(
    queue: Arc<PostgresTaskQueue>,
    task_id: Uuid,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.heartbeat(task_id).await {
                    warn!(task_id = %task_id, error = %e, "heartbeat failed");
                }
            }
        }
    }
}

async fn sweep_loop(
    queue: Arc<PostgresTaskQueue>,
    stuck_threshold: Duration,
    shutdown: CancellationToken,
) {
    let interval = stuck_threshold / 2;
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(30)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match queue.recover_stuck(stuck_threshold).await {
                    Ok(recovered) if !recovered.is_empty() => {
                        info!(count = recovered.len(), "sweeper recovered stuck tasks");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sweeper pass failed"),
                }
            }
        }
    }
}
