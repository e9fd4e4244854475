//! Per-task execution.
//!
//! Takes one claimed task from hydration to terminal state: open the
//! sealed credential, check admission, stage the input, drive the engine
//! with checkpointing, flush counters to the job store on a bounded
//! interval (observing cancellation there), and materialize the final
//! output on completion.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use batch_core::{
    filter_pending, BreakerSnapshot, CheckpointStore, DatasetAdapter, Engine, EngineError,
    EngineEvent, JsonlAdapter,
};
use llm_client::{CompletionClient, HttpCompletionClient, RetryPolicy};

use crate::admission::AdmissionPolicy;
use crate::credentials::CredentialCipher;
use crate::jobs::{JobStatus, JobStore};
use crate::storage::BlobStore;
use crate::tasks::{FailureKind, TaskRecord};
use crate::usage::{UsageLedger, UsageTotals};

lazy_static! {
    static ref PATH_REGEX: Regex = Regex::new(r"(?:/[\w.\-]+){2,}").unwrap();
}

/// Strip internals from an error message before it reaches the job row.
///
/// First line only, filesystem paths replaced, bounded length. Never
/// credentials: those live only inside the worker process.
pub fn sanitize_error(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or_default().trim();
    let cleaned = PATH_REGEX.replace_all(first_line, "[path]");
    let mut message: String = cleaned.chars().take(300).collect();
    if message.is_empty() {
        message = "internal error".to_string();
    }
    message
}

/// A task-level failure with its retry classification.
#[derive(Debug)]
pub struct TaskError {
    pub message: String,
    pub kind: FailureKind,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retryable,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::NonRetryable,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            message: "interrupted by worker shutdown".into(),
            kind: FailureKind::Shutdown,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub checkpoint_root: PathBuf,
    pub staging_root: PathBuf,
    pub llm_base_url: Option<String>,
    /// Backoff schedule for retryable completion errors.
    pub retry: RetryPolicy,
    /// Flush counters after this many results...
    pub flush_every: usize,
    /// ...or after this long, whichever comes first.
    pub flush_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            checkpoint_root: PathBuf::from("checkpoints"),
            staging_root: PathBuf::from("staging"),
            llm_base_url: None,
            retry: RetryPolicy::default(),
            flush_every: 25,
            flush_interval: Duration::from_secs(10),
        }
    }
}

pub struct TaskRunner {
    jobs: JobStore,
    ledger: UsageLedger,
    admission: AdmissionPolicy,
    blobs: Arc<dyn BlobStore>,
    cipher: Arc<CredentialCipher>,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(
        jobs: JobStore,
        ledger: UsageLedger,
        admission: AdmissionPolicy,
        blobs: Arc<dyn BlobStore>,
        cipher: Arc<CredentialCipher>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            admission,
            blobs,
            cipher,
            config,
        }
    }

    /// Execute one claimed task to a terminal outcome.
    pub async fn run_task(
        &self,
        task: &TaskRecord,
        shutdown: CancellationToken,
    ) -> Result<(), TaskError> {
        let payload = task
            .payload()
            .map_err(|e| TaskError::permanent(format!("undecodable payload: {e}")))?;
        let job_id = payload.job_id;

        let api_key = match self.cipher.open(&payload.credential) {
            Ok(key) => key,
            Err(e) => {
                self.fail_job(job_id, "credential could not be opened").await;
                return Err(TaskError::permanent(format!("credential: {e}")));
            }
        };

        // Admission runs before any staging: a job that is out of policy
        // must not pay for a fetch. The job's declared unit bound stands
        // in for the exact count until the input is on disk.
        let spend = self
            .ledger
            .monthly_spend(payload.owner_id)
            .await
            .map_err(|e| TaskError::retryable(format!("ledger: {e}")))?;
        if let Err(reason) = self.admission.admit(
            &payload.params.model,
            &payload.template,
            payload.max_units.unwrap_or(0),
            payload.params.max_tokens,
            payload.max_units,
            spend,
        ) {
            self.fail_job(job_id, &reason.to_string()).await;
            return Err(TaskError::permanent(format!("admission denied: {reason}")));
        }

        // Stage the input locally.
        let staging = self.config.staging_root.join(job_id.to_string());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| TaskError::retryable(format!("staging dir: {e}")))?;
        let input_path = staging.join("input.jsonl");
        let output_path = staging.join("output.jsonl");

        if let Err(e) = self.blobs.fetch(&payload.input_key, &input_path).await {
            self.fail_job(job_id, "input dataset could not be fetched").await;
            return Err(TaskError::permanent(format!("fetch input: {e}")));
        }

        let adapter = JsonlAdapter::new(&input_path, &output_path);

        // One cheap pass for the unit total; also surfaces malformed
        // input before any LM call is made.
        let total = match count_units(&adapter).await {
            Ok(total) => total,
            Err(e) => {
                self.fail_job(job_id, &sanitize_error(&e.to_string())).await;
                return Err(TaskError::permanent(format!("unreadable input: {e}")));
            }
        };

        // Re-validate size and budget with the exact count.
        if let Err(reason) = self.admission.admit(
            &payload.params.model,
            &payload.template,
            total as i64,
            payload.params.max_tokens,
            payload.max_units,
            spend,
        ) {
            self.fail_job(job_id, &reason.to_string()).await;
            return Err(TaskError::permanent(format!("admission denied: {reason}")));
        }

        self.jobs
            .start_processing(job_id, total as i64)
            .await
            .map_err(|e| TaskError::retryable(format!("job store: {e}")))?;

        // Checkpoint: a retried task resumes instead of replaying.
        let store = CheckpointStore::new(&self.config.checkpoint_root, &job_id.to_string());
        store
            .init()
            .await
            .map_err(|e| TaskError::retryable(format!("checkpoint: {e}")))?;
        let completed = store
            .completed_indices()
            .await
            .map_err(|e| TaskError::retryable(format!("checkpoint: {e}")))?;
        let failed_before = store
            .failed_indices()
            .await
            .map_err(|e| TaskError::retryable(format!("checkpoint: {e}")))?;

        let mut processed_count = completed.len() as i64;
        let mut failed_count = failed_before.len() as i64;
        let recorded: HashSet<u64> = completed.union(&failed_before).copied().collect();
        if !recorded.is_empty() {
            info!(
                job_id = %job_id,
                recorded = recorded.len(),
                "resuming from checkpoint"
            );
        }

        let mut client =
            HttpCompletionClient::new(api_key).with_retry_policy(self.config.retry.clone());
        if let Some(base_url) = &self.config.llm_base_url {
            client = client.with_base_url(base_url.clone());
        }
        let client: Arc<dyn CompletionClient> = Arc::new(client);

        let engine = Arc::new(
            Engine::new(
                client,
                payload.template.clone(),
                payload.params.clone(),
                payload.engine.clone(),
            )
            .with_cancellation(shutdown.child_token()),
        );

        let units = adapter
            .read_units()
            .await
            .map_err(|e| TaskError::retryable(format!("open input: {e}")))?;
        let units = filter_pending(units, recorded);

        let (tx, mut rx) = mpsc::channel(64);
        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(units, tx).await }
        });

        let mut since_flush = 0usize;
        let mut last_flush = Instant::now();
        let mut breaker_trip: Option<BreakerSnapshot> = None;
        let mut job_cancelled = false;
        let mut checkpoint_failed = false;

        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Result(result) => {
                    if let Err(e) = store.append(&result).await {
                        error!(job_id = %job_id, error = %e, "checkpoint append failed");
                        checkpoint_failed = true;
                        engine.cancellation_token().cancel();
                        // Keep draining; the run ends on its own.
                        continue;
                    }
                    if result.is_success() {
                        processed_count += 1;
                    } else {
                        failed_count += 1;
                    }
                    since_flush += 1;

                    if since_flush >= self.config.flush_every
                        || last_flush.elapsed() >= self.config.flush_interval
                    {
                        since_flush = 0;
                        last_flush = Instant::now();
                        if self
                            .flush(job_id, processed_count, failed_count)
                            .await
                            .unwrap_or(false)
                        {
                            job_cancelled = true;
                            engine.cancellation_token().cancel();
                        }
                    }
                }
                EngineEvent::BreakerTripped(snapshot) => {
                    // No operator to prompt in a worker; fail the task.
                    warn!(
                        job_id = %job_id,
                        consecutive_failures = snapshot.consecutive_failures,
                        "circuit breaker tripped"
                    );
                    breaker_trip = Some(snapshot);
                    engine.cancellation_token().cancel();
                }
            }
        }

        // Failing the job is terminal, so these outcomes must not ask the
        // queue to retry the task: a later attempt could not move the job
        // out of 'failed' again.
        let summary = match run.await {
            Ok(Ok(summary)) => summary,
            Ok(Err(EngineError::Adapter(e))) => {
                self.fail_job(job_id, &sanitize_error(&e.to_string())).await;
                return Err(TaskError::permanent(format!("adapter: {e}")));
            }
            Ok(Err(e)) => {
                self.fail_job(job_id, "internal processing error").await;
                return Err(TaskError::permanent(format!("engine: {e}")));
            }
            Err(join_err) => {
                self.fail_job(job_id, "internal processing error").await;
                return Err(TaskError::permanent(format!("engine task: {join_err}")));
            }
        };

        // Whatever happened, account for the tokens that were spent.
        let totals = UsageTotals {
            prompt_tokens: summary.prompt_tokens as i64,
            completion_tokens: summary.completion_tokens as i64,
            cost_usd: summary.cost_usd,
        };
        if totals.prompt_tokens > 0 || totals.completion_tokens > 0 {
            if let Err(e) = self
                .ledger
                .record(payload.owner_id, job_id, &payload.params.model, totals)
                .await
            {
                warn!(job_id = %job_id, error = %e, "usage record failed");
            }
        }

        let _ = self
            .jobs
            .flush_counters(job_id, processed_count, failed_count)
            .await;

        if let Some(snapshot) = breaker_trip {
            let detail = snapshot.last_error.as_deref().unwrap_or("repeated failures");
            let message = sanitize_error(&format!(
                "circuit breaker tripped after {} consecutive failures: {detail}",
                snapshot.consecutive_failures
            ));
            self.fail_job(job_id, &message).await;
            return Err(TaskError::permanent(message));
        }

        if checkpoint_failed {
            // The log may be short a record; a retry resumes from what
            // did land on disk.
            return Err(TaskError::retryable("checkpoint append failed"));
        }

        if job_cancelled {
            // The job row already says cancelled; the checkpoint stays
            // valid for a later resubmission.
            info!(job_id = %job_id, "job cancelled, task closing");
            return Ok(());
        }

        if summary.cancelled {
            // Cancellation came from worker shutdown, not the job.
            return Err(TaskError::shutdown());
        }

        // Materialize the final output and hand it to the sink.
        let all = store
            .read_all()
            .await
            .map_err(|e| TaskError::retryable(format!("checkpoint read: {e}")))?;
        adapter
            .write_results(&all)
            .await
            .map_err(|e| TaskError::retryable(format!("write output: {e}")))?;
        if let Err(e) = self.blobs.store(&output_path, &payload.output_key).await {
            // Transient: the job stays processing and a retried task
            // re-materializes from the checkpoint and uploads again.
            return Err(TaskError::retryable(format!("store output: {e}")));
        }

        self.jobs
            .mark_completed(job_id, processed_count, failed_count)
            .await
            .map_err(|e| TaskError::retryable(format!("job store: {e}")))?;

        info!(
            job_id = %job_id,
            processed = processed_count,
            failed = failed_count,
            cost_usd = summary.cost_usd,
            "job completed"
        );
        Ok(())
    }

    /// Push counters and poll for cancellation. Returns true when the
    /// job has been cancelled externally.
    async fn flush(&self, job_id: uuid::Uuid, processed: i64, failed: i64) -> anyhow::Result<bool> {
        self.jobs.flush_counters(job_id, processed, failed).await?;
        Ok(self.jobs.status_of(job_id).await? == JobStatus::Cancelled)
    }

    async fn fail_job(&self, job_id: uuid::Uuid, message: &str) {
        if let Err(e) = self.jobs.mark_failed(job_id, message).await {
            error!(job_id = %job_id, error = %e, "failed to mark job failed");
        }
    }
}

async fn count_units(adapter: &JsonlAdapter) -> anyhow::Result<u64> {
    let mut stream = adapter.read_units().await?;
    let mut total = 0u64;
    while let Some(item) = stream.next().await {
        item?;
        total += 1;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_paths() {
        let message = sanitize_error("failed to open /var/lib/batchline/staging/abc/input.jsonl");
        assert!(!message.contains("/var/lib"));
        assert!(message.contains("[path]"));
    }

    #[test]
    fn sanitize_keeps_first_line_only() {
        let message = sanitize_error("boom\n  at worker.rs:42\n  at runner.rs:10");
        assert_eq!(message, "boom");
    }

    #[test]
    fn sanitize_bounds_length() {
        let long = "x".repeat(2000);
        assert!(sanitize_error(&long).len() <= 300);
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_error(""), "internal error");
        assert_eq!(sanitize_error("\n\n"), "internal error");
    }

    #[test]
    fn task_error_kinds() {
        assert!(TaskError::retryable("x").kind.should_retry());
        assert!(!TaskError::permanent("x").kind.should_retry());
        assert!(TaskError::shutdown().kind.should_retry());
    }
}
