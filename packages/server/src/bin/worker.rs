// Worker process: leases tasks from the queue and runs them.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::{
    AdmissionPolicy, Config, CredentialCipher, JobStore, LocalBlobStore, PostgresTaskQueue,
    RunnerConfig, TaskRunner, TaskWorker, TaskWorkerConfig, UsageLedger,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let cipher = Arc::new(
        CredentialCipher::from_base64_key(&config.payload_key)
            .context("PAYLOAD_KEY is unusable")?,
    );

    let admission = AdmissionPolicy::new(
        config.allowed_models.clone(),
        config.content_moderation,
        config.monthly_budget_enforcement,
        config.monthly_budget_usd,
        config.max_units_limit,
    );

    let runner = Arc::new(TaskRunner::new(
        JobStore::new(pool.clone()),
        UsageLedger::new(pool.clone()),
        admission,
        Arc::new(LocalBlobStore::new(&config.storage_root)),
        cipher,
        RunnerConfig {
            checkpoint_root: config.checkpoint_root.clone().into(),
            staging_root: format!("{}/staging", config.storage_root).into(),
            llm_base_url: config.llm_base_url.clone(),
            retry: llm_client::RetryPolicy {
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
                jitter: config.retry_jitter,
            },
            ..Default::default()
        },
    ));

    let queue = Arc::new(PostgresTaskQueue::new(
        pool,
        server_core::tasks::DEFAULT_QUEUE,
    ));

    let worker_config = TaskWorkerConfig {
        stuck_threshold: config.stuck_task_timeout,
        ..Default::default()
    };
    let worker = TaskWorker::with_config(queue, runner, worker_config);

    // Graceful shutdown: stop leasing, let the in-flight task drain.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining");
            signal_token.cancel();
        }
    });

    worker.run(shutdown).await
}
