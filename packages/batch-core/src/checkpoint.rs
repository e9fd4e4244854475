//! Durable checkpoint: append-only results log plus a progress blob.
//!
//! Per job, a directory holding `results.jsonl` (one result record per
//! line, re-appends allowed, last write wins on read) and
//! `progress.json` (counters plus the run parameters needed for exact
//! resume). A crash mid-append leaves a partial tail line, which the
//! readers silently discard.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use llm_client::CompletionParams;

use crate::engine::EngineConfig;
use crate::types::{RowResult, UnitOutcome};

pub const RESULTS_FILE: &str = "results.jsonl";
pub const PROGRESS_FILE: &str = "progress.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode checkpoint record: {0}")]
    Encode(String),

    #[error("progress blob is unreadable: {0}")]
    Progress(String),
}

/// Counters plus the parameters a resume must reuse verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: String,
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    // Run parameters. Resume takes these from here, never from flags.
    pub template: String,
    pub params: CompletionParams,
    pub engine: EngineConfig,
    pub input: String,
    pub output: String,
}

pub struct CheckpointStore {
    dir: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl CheckpointStore {
    pub fn new(root: impl AsRef<Path>, job_id: &str) -> Self {
        Self {
            dir: root.as_ref().join(job_id),
            writer: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    /// True when a progress blob exists for this job.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.progress_path())
            .await
            .unwrap_or(false)
    }

    pub async fn init(&self) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Append one result record and flush it to disk.
    pub async fn append(&self, result: &RowResult) -> Result<(), CheckpointError> {
        let line =
            serde_json::to_string(result).map_err(|e| CheckpointError::Encode(e.to_string()))?;

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.results_path())
                .await?;
            *guard = Some(BufWriter::new(file));
        }
        let writer = guard.as_mut().expect("writer just initialized");
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// All records, deduplicated by `_idx` keeping the last write,
    /// in ascending index order.
    pub async fn read_all(&self) -> Result<Vec<RowResult>, CheckpointError> {
        Ok(self.read_deduped().await?.into_values().collect())
    }

    /// Indices whose latest record succeeded (no error, no parse error).
    pub async fn completed_indices(&self) -> Result<HashSet<u64>, CheckpointError> {
        Ok(self
            .read_deduped()
            .await?
            .into_iter()
            .filter(|(_, r)| r.outcome() == UnitOutcome::Succeeded)
            .map(|(i, _)| i)
            .collect())
    }

    /// Indices whose latest record carries an error or parse-error marker.
    pub async fn failed_indices(&self) -> Result<HashSet<u64>, CheckpointError> {
        Ok(self
            .read_deduped()
            .await?
            .into_iter()
            .filter(|(_, r)| r.outcome() != UnitOutcome::Succeeded)
            .map(|(i, _)| i)
            .collect())
    }

    /// Overwrite the progress blob with a consistent new version.
    pub async fn save_progress(&self, progress: &ProgressRecord) -> Result<(), CheckpointError> {
        let encoded = serde_json::to_vec_pretty(progress)
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;

        // Write-then-rename keeps the blob whole under a crash.
        let tmp = self.dir.join(format!("{PROGRESS_FILE}.tmp"));
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, self.progress_path()).await?;
        Ok(())
    }

    pub async fn load_progress(&self) -> Result<ProgressRecord, CheckpointError> {
        let mut file = File::open(self.progress_path())
            .await
            .map_err(|e| CheckpointError::Progress(e.to_string()))?;
        let mut raw = String::new();
        file.read_to_string(&mut raw).await?;
        serde_json::from_str(&raw).map_err(|e| CheckpointError::Progress(e.to_string()))
    }

    async fn read_deduped(&self) -> Result<BTreeMap<u64, RowResult>, CheckpointError> {
        let raw = match tokio::fs::read_to_string(self.results_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut latest = BTreeMap::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // Undecodable lines are crash-truncated tails; drop them.
            match serde_json::from_str::<RowResult>(line) {
                Ok(record) => {
                    latest.insert(record.index, record);
                }
                Err(_) => continue,
            }
        }
        Ok(latest)
    }
}
