//! Batch-process local datasets through an LM completion service.

mod driver;
mod params;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use params::{FileParams, ProcessFlags};

#[derive(Parser)]
#[command(name = "batchline")]
#[command(about = "Stream dataset records through an LM and write enriched results")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a local dataset (JSONL in, JSONL out)
    Process {
        /// Input dataset path
        input: PathBuf,
        /// Output path for enriched records
        output: PathBuf,

        /// Prompt template with {field} placeholders
        #[arg(long)]
        prompt: Option<String>,
        /// TOML parameter file; flags override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Model name
        #[arg(long)]
        model: Option<String>,
        /// Execution mode: sequential or async
        #[arg(long)]
        mode: Option<String>,
        /// Concurrency in async mode
        #[arg(long)]
        batch_size: Option<usize>,
        /// Maximum completion tokens
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Run on K random units first and confirm before continuing
        #[arg(long)]
        preview: Option<usize>,
        /// Prompt to continue after every N completions
        #[arg(long)]
        checkin_interval: Option<u64>,
        /// Consecutive fatal failures before pausing (0 disables)
        #[arg(long)]
        circuit_breaker: Option<u32>,
        /// Skip structured parsing of completions
        #[arg(long)]
        no_post_process: bool,
        /// Keep the parsed payload nested instead of merging
        #[arg(long)]
        no_merge: bool,
        /// Keep the raw completion text on successful parses
        #[arg(long)]
        include_raw: bool,
        /// Seed for preview sampling
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Resume a checkpointed job
    Resume {
        /// Job ID printed when the run started
        job_id: String,
        /// Prompt to continue after every N completions
        #[arg(long)]
        checkin_interval: Option<u64>,
        /// Also re-submit units whose latest attempt failed
        #[arg(long)]
        retry_failures: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Process {
            input,
            output,
            prompt,
            config,
            model,
            mode,
            batch_size,
            max_tokens,
            preview,
            checkin_interval,
            circuit_breaker,
            no_post_process,
            no_merge,
            include_raw,
            seed,
        } => {
            let file = match config {
                Some(path) => match FileParams::load(&path) {
                    Ok(file) => file,
                    Err(e) => return fail(e),
                },
                None => FileParams::default(),
            };
            let flags = ProcessFlags {
                prompt,
                model,
                mode,
                batch_size,
                max_tokens,
                preview,
                checkin_interval,
                circuit_breaker,
                no_post_process,
                no_merge,
                include_raw,
                seed,
            };
            match params::resolve(flags, file) {
                Ok(options) => driver::run_process(input, output, options).await,
                Err(e) => return fail(e),
            }
        }
        Commands::Resume {
            job_id,
            checkin_interval,
            retry_failures,
        } => driver::run_resume(job_id, checkin_interval, retry_failures).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(e),
    }
}

fn fail(error: anyhow::Error) -> ExitCode {
    eprintln!("{} {error:#}", style("error:").red().bold());
    ExitCode::FAILURE
}
