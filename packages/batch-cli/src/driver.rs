//! Interactive driver: runs the engine against a local dataset with
//! preview runs, periodic check-ins, breaker prompts, and resume.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};
use rand::prelude::*;
use tokio::sync::mpsc;
use tracing::debug;

use batch_core::{
    filter_pending, required_fields, CheckpointStore, DatasetAdapter, Engine, EngineEvent,
    EngineRunSummary, JsonlAdapter, ProgressRecord, Unit, UnitOutcome,
};
use llm_client::{CompletionClient, HttpCompletionClient};

use crate::params::RunOptions;

/// Where per-job checkpoints live. Overridable for tests and shared
/// machines.
pub fn checkpoint_root() -> PathBuf {
    std::env::var("BATCHLINE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".batchline"))
        .join("checkpoints")
}

fn build_client() -> Result<Arc<dyn CompletionClient>> {
    let mut client = HttpCompletionClient::from_env()
        .map_err(|_| anyhow!("LLM_API_KEY must be set to call the completion API"))?;
    if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
        client = client.with_base_url(base_url);
    }
    Ok(Arc::new(client))
}

/// How a drive loop ended.
enum DriveEnd {
    Completed(EngineRunSummary),
    /// Interrupted (pause, decline after trip, ctrl-c); checkpoint kept.
    Paused(EngineRunSummary),
}

pub async fn run_process(input: PathBuf, output: PathBuf, options: RunOptions) -> Result<()> {
    let client = build_client()?;
    let adapter = JsonlAdapter::new(&input, &output);

    let all_units = collect_units(&adapter).await?;
    let total = all_units.len() as u64;
    warn_on_schema_mismatch(&options.template, &adapter).await;

    if options.preview > 0
        && !preview_run(&client, &all_units, &options).await?
    {
        println!("{}", style("Preview declined, nothing processed.").yellow());
        return Ok(());
    }

    let job_id = format!("job-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let store = CheckpointStore::new(checkpoint_root(), &job_id);
    store.init().await?;

    let mut progress = ProgressRecord {
        job_id: job_id.clone(),
        total,
        processed: 0,
        failed: 0,
        started_at: Utc::now(),
        last_update: Utc::now(),
        template: options.template.clone(),
        params: options.params.clone(),
        engine: options.engine.clone(),
        input: input.display().to_string(),
        output: output.display().to_string(),
    };
    store.save_progress(&progress).await?;

    println!(
        "{} {} ({} units, model {})",
        style("Starting").green().bold(),
        job_id,
        total,
        progress.params.model
    );

    let engine = Arc::new(Engine::new(
        client,
        options.template.clone(),
        options.params.clone(),
        options.engine.clone(),
    ));
    let units = adapter.read_units().await?;

    let end = drive(
        engine,
        units,
        &store,
        &mut progress,
        options.checkin_interval,
    )
    .await?;

    finish(end, &adapter, &store, &job_id).await
}

pub async fn run_resume(
    job_id: String,
    checkin_interval: Option<u64>,
    retry_failures: bool,
) -> Result<()> {
    let store = CheckpointStore::new(checkpoint_root(), &job_id);
    let mut progress = store
        .load_progress()
        .await
        .with_context(|| format!("no checkpoint found for {job_id}"))?;

    let client = build_client()?;
    let adapter = JsonlAdapter::new(&progress.input, &progress.output);

    let completed = store.completed_indices().await?;
    let failed = store.failed_indices().await?;

    // Completed indices are always skipped. Failed ones are final too,
    // unless the caller asked to give them another attempt.
    let skip: HashSet<u64> = if retry_failures {
        completed.clone()
    } else {
        completed.union(&failed).copied().collect()
    };

    let remaining = progress.total.saturating_sub(skip.len() as u64);
    println!(
        "{} {} ({} done, {} failed, {} to go)",
        style("Resuming").green().bold(),
        job_id,
        completed.len(),
        failed.len(),
        remaining
    );
    if remaining == 0 {
        println!("Nothing left to process.");
        return finish(
            DriveEnd::Completed(EngineRunSummary::default()),
            &adapter,
            &store,
            &job_id,
        )
        .await;
    }

    progress.processed = completed.len() as u64;
    progress.failed = if retry_failures { 0 } else { failed.len() as u64 };

    // Template and parameters come from the progress blob, never from
    // flags: a resumed job runs exactly as it started.
    let engine = Arc::new(Engine::new(
        client,
        progress.template.clone(),
        progress.params.clone(),
        progress.engine.clone(),
    ));
    let units = filter_pending(adapter.read_units().await?, skip);

    let end = drive(
        engine,
        units,
        &store,
        &mut progress,
        checkin_interval.unwrap_or(0),
    )
    .await?;

    finish(end, &adapter, &store, &job_id).await
}

async fn drive(
    engine: Arc<Engine>,
    units: batch_core::UnitStream,
    store: &CheckpointStore,
    progress: &mut ProgressRecord,
    mut checkin_interval: u64,
) -> Result<DriveEnd> {
    // Ctrl-C cancels the token; in-flight units drain and the
    // checkpoint stays valid.
    let cancel = engine.cancellation_token();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, finishing in-flight units...");
                cancel.cancel();
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(64);
    let run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(units, tx).await }
    });

    let mut paused = false;
    let mut since_checkin = 0u64;
    let mut since_save = 0u64;

    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Result(result) => {
                store.append(&result).await?;
                match result.outcome() {
                    UnitOutcome::Succeeded => progress.processed += 1,
                    _ => progress.failed += 1,
                }
                print_result_line(&result, progress);

                since_save += 1;
                if since_save >= 10 {
                    since_save = 0;
                    progress.last_update = Utc::now();
                    store.save_progress(progress).await?;
                }

                since_checkin += 1;
                if checkin_interval > 0 && since_checkin >= checkin_interval && !paused {
                    since_checkin = 0;
                    match checkin_prompt(progress)? {
                        Checkin::Continue => {}
                        Checkin::Pause => {
                            paused = true;
                            engine.cancellation_token().cancel();
                        }
                        Checkin::FinishSilently => checkin_interval = 0,
                    }
                }
            }
            EngineEvent::BreakerTripped(snapshot) => {
                println!(
                    "\n{} {} consecutive failures (last: {})",
                    style("Circuit breaker tripped:").red().bold(),
                    snapshot.consecutive_failures,
                    snapshot.last_error.as_deref().unwrap_or("unknown")
                );
                let resume = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Continue processing?")
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if resume {
                    engine.breaker().reset();
                    engine.resume_after_trip();
                } else {
                    paused = true;
                    engine.cancellation_token().cancel();
                }
            }
        }
    }

    let summary = run
        .await
        .context("engine task aborted")?
        .context("processing aborted")?;

    progress.last_update = Utc::now();
    store.save_progress(progress).await?;

    if paused || summary.cancelled {
        Ok(DriveEnd::Paused(summary))
    } else {
        Ok(DriveEnd::Completed(summary))
    }
}

async fn finish(
    end: DriveEnd,
    adapter: &JsonlAdapter,
    store: &CheckpointStore,
    job_id: &str,
) -> Result<()> {
    match end {
        DriveEnd::Paused(summary) => {
            println!(
                "\n{} {} processed, {} failed so far.",
                style("Paused.").yellow().bold(),
                summary.succeeded,
                summary.failed + summary.parse_failed
            );
            println!("Resume with: batchline resume {job_id}");
            Ok(())
        }
        DriveEnd::Completed(summary) => {
            let all = store.read_all().await?;
            adapter.write_results(&all).await?;

            println!(
                "\n{} {} results written to {}",
                style("Done.").green().bold(),
                all.len(),
                adapter.output_path().display()
            );
            println!(
                "  {} succeeded, {} parse-failed, {} failed",
                summary.succeeded, summary.parse_failed, summary.failed
            );
            println!(
                "  {} prompt + {} completion tokens, ${:.4}",
                summary.prompt_tokens, summary.completion_tokens, summary.cost_usd
            );
            Ok(())
        }
    }
}

enum Checkin {
    Continue,
    Pause,
    FinishSilently,
}

fn checkin_prompt(progress: &ProgressRecord) -> Result<Checkin> {
    println!(
        "\n{} {}/{} processed, {} failed",
        style("Check-in:").cyan().bold(),
        progress.processed,
        progress.total,
        progress.failed
    );
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("How should we proceed?")
        .items(&[
            "Continue",
            "Pause and exit (checkpoint kept)",
            "Finish without further check-ins",
        ])
        .default(0)
        .interact()?;

    Ok(match choice {
        1 => Checkin::Pause,
        2 => Checkin::FinishSilently,
        _ => Checkin::Continue,
    })
}

fn print_result_line(result: &batch_core::RowResult, progress: &ProgressRecord) {
    let done = progress.processed + progress.failed;
    match result.outcome() {
        UnitOutcome::Succeeded => {
            println!(
                "[{}/{}] {} unit {}",
                done,
                progress.total,
                style("ok").green(),
                result.index
            );
        }
        UnitOutcome::ParseFailed => {
            println!(
                "[{}/{}] {} unit {} (unparseable completion)",
                done,
                progress.total,
                style("??").yellow(),
                result.index
            );
        }
        UnitOutcome::Failed => {
            println!(
                "[{}/{}] {} unit {}: {}",
                done,
                progress.total,
                style("err").red(),
                result.index,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
    }
}

/// Run K randomly sampled units through the same pipeline and ask
/// whether to continue. Returns false when the user declines.
async fn preview_run(
    client: &Arc<dyn CompletionClient>,
    all_units: &[Unit],
    options: &RunOptions,
) -> Result<bool> {
    let k = options.preview.min(all_units.len());
    if k == 0 {
        return Ok(true);
    }

    let mut rng: StdRng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut sampled: Vec<Unit> = all_units.choose_multiple(&mut rng, k).cloned().collect();
    sampled.sort_by_key(|u| u.index);

    println!(
        "{} {} of {} units",
        style("Previewing").cyan().bold(),
        k,
        all_units.len()
    );

    // Same pipeline, no breaker, no checkpoint.
    let mut preview_config = options.engine.clone();
    preview_config.mode = batch_core::EngineMode::Sequential;
    preview_config.breaker_threshold = 0;
    let engine = Engine::new(
        client.clone(),
        options.template.clone(),
        options.params.clone(),
        preview_config,
    );

    let stream: batch_core::UnitStream = Box::pin(futures::stream::iter(
        sampled
            .clone()
            .into_iter()
            .map(Ok::<Unit, batch_core::AdapterError>),
    ));
    let (tx, mut rx) = mpsc::channel(8);
    let run = tokio::spawn(async move { engine.run(stream, tx).await });

    while let Some(event) = rx.recv().await {
        if let EngineEvent::Result(result) = event {
            if let Some(unit) = sampled.iter().find(|u| u.index == result.index) {
                if let Ok(prompt) = batch_core::render(&options.template, unit) {
                    println!("\n{}", style(format!("--- unit {} ---", unit.index)).dim());
                    println!("{}", style(&prompt).dim());
                }
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    debug!("preview run finished");
    let _ = run.await;

    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Continue with the full run?")
        .default(true)
        .interact()
        .unwrap_or(false))
}

async fn collect_units(adapter: &JsonlAdapter) -> Result<Vec<Unit>> {
    use futures::StreamExt;
    let mut stream = adapter.read_units().await?;
    let mut units = Vec::new();
    while let Some(item) = stream.next().await {
        units.push(item?);
    }
    Ok(units)
}

async fn warn_on_schema_mismatch(template: &str, adapter: &JsonlAdapter) {
    let schema = adapter.schema().await;
    if schema.is_empty() {
        return;
    }
    let known: HashSet<&str> = schema.iter().map(String::as_str).collect();
    for field in required_fields(template) {
        if !known.contains(field.as_str()) {
            println!(
                "{} template field `{{{field}}}` is not in the first record",
                style("warning:").yellow()
            );
        }
    }
}
