//! Newline-delimited JSON adapter.
//!
//! One JSON object per line on both sides. Blank lines are skipped; any
//! `_idx` present in the source is discarded in favor of the
//! system-assigned ordinal.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::adapter::{confine, AdapterError, DatasetAdapter, UnitStream};
use crate::types::{RowResult, Unit};

pub struct JsonlAdapter {
    input: PathBuf,
    output: PathBuf,
    /// First write truncates the sink, later writes append, so callers
    /// may hand over results in one batch or incrementally.
    output_started: AtomicBool,
}

impl JsonlAdapter {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            output_started: AtomicBool::new(false),
        }
    }

    /// Construct with both paths confined beneath `root`.
    pub fn rooted(
        root: impl AsRef<Path>,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<Self, AdapterError> {
        let root = root.as_ref();
        Ok(Self::new(
            confine(root, input.as_ref())?,
            confine(root, output.as_ref())?,
        ))
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }
}

#[async_trait]
impl DatasetAdapter for JsonlAdapter {
    async fn read_units(&self) -> Result<UnitStream, AdapterError> {
        let file = File::open(&self.input)
            .await
            .map_err(|e| AdapterError::Open(format!("{}: {e}", self.input.display())))?;
        let lines = BufReader::new(file).lines();

        let stream = futures::stream::unfold(
            (lines, 0usize, 0u64),
            |(mut lines, mut file_line, mut index)| async move {
                loop {
                    file_line += 1;
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let item = match serde_json::from_str::<Map<String, Value>>(&line) {
                                Ok(mut fields) => {
                                    fields.remove("_idx");
                                    let unit = Unit::new(index, fields);
                                    index += 1;
                                    Ok(unit)
                                }
                                Err(e) => Err(AdapterError::Malformed {
                                    line: file_line,
                                    reason: e.to_string(),
                                }),
                            };
                            return Some((item, (lines, file_line, index)));
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((Err(AdapterError::Io(e)), (lines, file_line, index)))
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn write_results(&self, results: &[RowResult]) -> Result<(), AdapterError> {
        let mut options = OpenOptions::new();
        if self.output_started.swap(true, Ordering::SeqCst) {
            options.append(true).create(true);
        } else {
            options.write(true).create(true).truncate(true);
        }
        let file = options
            .open(&self.output)
            .await
            .map_err(|e| AdapterError::Write(format!("{}: {e}", self.output.display())))?;

        let mut writer = BufWriter::new(file);
        for result in results {
            let line =
                serde_json::to_string(result).map_err(|e| AdapterError::Write(e.to_string()))?;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn schema(&self) -> Vec<String> {
        let Ok(file) = File::open(&self.input).await else {
            return Vec::new();
        };
        let mut lines = BufReader::new(file).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(fields) = serde_json::from_str::<Map<String, Value>>(&line) {
                return fields.keys().cloned().collect();
            }
            break;
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use llm_client::Usage;
    use serde_json::json;

    async fn collect(adapter: &JsonlAdapter) -> Vec<Unit> {
        let mut stream = adapter.read_units().await.unwrap();
        let mut units = Vec::new();
        while let Some(item) = stream.next().await {
            units.push(item.unwrap());
        }
        units
    }

    #[tokio::test]
    async fn reads_units_in_source_order_with_fresh_indices() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(
            &input,
            "{\"text\":\"hello\",\"_idx\":99}\n\n{\"text\":\"world\"}\n",
        )
        .unwrap();

        let adapter = JsonlAdapter::new(&input, dir.path().join("out.jsonl"));
        let units = collect(&adapter).await;
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].index, 0);
        assert_eq!(units[0].fields["text"], json!("hello"));
        assert_eq!(units[1].index, 1);
    }

    #[tokio::test]
    async fn rereading_yields_the_same_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(&input, "{\"a\":1}\n{\"a\":2}\n").unwrap();

        let adapter = JsonlAdapter::new(&input, dir.path().join("out.jsonl"));
        let first = collect(&adapter).await;
        let second = collect(&adapter).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn malformed_line_reports_its_position() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(&input, "{\"a\":1}\nnot json\n").unwrap();

        let adapter = JsonlAdapter::new(&input, dir.path().join("out.jsonl"));
        let mut stream = adapter.read_units().await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        match stream.next().await.unwrap() {
            Err(AdapterError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn incremental_writes_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.jsonl");
        let adapter = JsonlAdapter::new(dir.path().join("in.jsonl"), &output);

        let first = RowResult::completed(
            Unit::new(0, Map::new()),
            "a".into(),
            Usage::default(),
            1,
        );
        let second = RowResult::completed(
            Unit::new(1, Map::new()),
            "b".into(),
            Usage::default(),
            1,
        );

        adapter.write_results(std::slice::from_ref(&first)).await.unwrap();
        adapter.write_results(std::slice::from_ref(&second)).await.unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(written.lines().count(), 2);
    }

    #[tokio::test]
    async fn schema_reports_first_record_fields() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(&input, "{\"text\":\"x\",\"lang\":\"en\"}\n").unwrap();

        let adapter = JsonlAdapter::new(&input, dir.path().join("out.jsonl"));
        let mut schema = adapter.schema().await;
        schema.sort();
        assert_eq!(schema, vec!["lang".to_string(), "text".to_string()]);
    }

    #[test]
    fn rooted_rejects_traversal() {
        let err = JsonlAdapter::rooted("/data", "../input.jsonl", "out.jsonl");
        assert!(err.is_err());
    }
}
