//! Resume round-trip behavior: an interrupted run, continued from its
//! checkpoint, must converge on the same deduplicated result set as an
//! uninterrupted run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use batch_core::{
    filter_pending, CheckpointStore, DatasetAdapter, Engine, EngineConfig, EngineEvent,
    EngineMode, MemoryAdapter, RowResult,
};
use llm_client::{
    Completion, CompletionClient, CompletionError, CompletionParams, Result as LlmResult, Usage,
};

/// Deterministic stub: echoes the prompted word, except that `poison`
/// units fail fatally until the client is healed.
struct EchoClient {
    healed: AtomicBool,
}

impl EchoClient {
    fn new() -> Self {
        Self {
            healed: AtomicBool::new(false),
        }
    }

    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionClient for EchoClient {
    async fn complete(&self, prompt: &str, _params: &CompletionParams) -> LlmResult<Completion> {
        let word = prompt.split_whitespace().last().unwrap_or_default();
        if word.starts_with("poison") && !self.healed.load(Ordering::SeqCst) {
            return Err(CompletionError::InvalidRequest("poisoned unit".into()));
        }
        Ok(Completion {
            text: format!("{{\"echo\": \"{word}\"}}"),
            usage: Usage::default(),
        })
    }
}

fn dataset(n: usize) -> Vec<Map<String, Value>> {
    (0..n)
        .map(|i| {
            let mut fields = Map::new();
            fields.insert("word".into(), json!(format!("w{i}")));
            fields
        })
        .collect()
}

/// Drive an engine run, appending every result to the checkpoint and
/// cancelling after `stop_after` results if given.
async fn drive(
    engine: Arc<Engine>,
    adapter: &MemoryAdapter,
    store: &CheckpointStore,
    skip: HashSet<u64>,
    stop_after: Option<usize>,
) -> Vec<RowResult> {
    let stream = filter_pending(adapter.read_units().await.unwrap(), skip);
    let (tx, mut rx) = mpsc::channel(8);
    let run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(stream, tx).await }
    });

    let mut seen = Vec::new();
    while let Some(event) = rx.recv().await {
        if let EngineEvent::Result(result) = event {
            store.append(&result).await.unwrap();
            seen.push(result);
            if stop_after.is_some_and(|n| seen.len() >= n) {
                engine.cancellation_token().cancel();
            }
        }
    }
    run.await.unwrap().unwrap();
    seen
}

fn engine(client: Arc<dyn CompletionClient>, threshold: u32) -> Arc<Engine> {
    Arc::new(Engine::new(
        client,
        "echo {word}",
        CompletionParams::new("stub"),
        EngineConfig {
            breaker_threshold: threshold,
            ..Default::default()
        },
    ))
}

#[tokio::test]
async fn resume_after_interruption_completes_every_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path(), "resume-test");
    store.init().await.unwrap();

    let adapter = MemoryAdapter::new(dataset(20));
    let client: Arc<dyn CompletionClient> = Arc::new(EchoClient::new());

    // Interrupt after 8 completions. The engine may finish the unit it
    // was already driving, so the prefix can run slightly past 8.
    drive(
        engine(client.clone(), 5),
        &adapter,
        &store,
        HashSet::new(),
        Some(8),
    )
    .await;

    let completed = store.completed_indices().await.unwrap();
    let prefix = completed.len() as u64;
    assert!(prefix >= 8);
    assert!(prefix < 20);
    assert_eq!(completed, (0..prefix).collect());

    // Resume dispatches exactly the remaining indices.
    let resumed = drive(engine(client, 5), &adapter, &store, completed, None).await;
    let resumed_indices: HashSet<u64> = resumed.iter().map(|r| r.index).collect();
    assert_eq!(resumed_indices, (prefix..20).collect());

    let all = store.read_all().await.unwrap();
    assert_eq!(all.len(), 20);
    for (i, record) in all.iter().enumerate() {
        assert_eq!(record.index, i as u64);
        assert_eq!(record.fields["echo"], json!(format!("w{i}")));
    }
}

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let uninterrupted_dir = tempfile::tempdir().unwrap();
    let uninterrupted = CheckpointStore::new(uninterrupted_dir.path(), "straight");
    uninterrupted.init().await.unwrap();

    let interrupted_dir = tempfile::tempdir().unwrap();
    let interrupted = CheckpointStore::new(interrupted_dir.path(), "stopped");
    interrupted.init().await.unwrap();

    let adapter = MemoryAdapter::new(dataset(12));
    let client: Arc<dyn CompletionClient> = Arc::new(EchoClient::new());

    drive(
        engine(client.clone(), 5),
        &adapter,
        &uninterrupted,
        HashSet::new(),
        None,
    )
    .await;

    drive(
        engine(client.clone(), 5),
        &adapter,
        &interrupted,
        HashSet::new(),
        Some(5),
    )
    .await;
    let done = interrupted.completed_indices().await.unwrap();
    drive(engine(client, 5), &adapter, &interrupted, done, None).await;

    let straight = uninterrupted.read_all().await.unwrap();
    let stitched = interrupted.read_all().await.unwrap();
    assert_eq!(straight, stitched);
}

#[tokio::test]
async fn retry_failures_keeps_the_later_result() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path(), "retry-failures");
    store.init().await.unwrap();

    // Unit 3 is poisoned: fatal on the first run.
    let mut fields = dataset(6);
    fields[3].insert("word".into(), json!("poison3"));
    let adapter = MemoryAdapter::new(fields);

    let echo = Arc::new(EchoClient::new());
    let client: Arc<dyn CompletionClient> = echo.clone();

    drive(
        engine(client.clone(), 0),
        &adapter,
        &store,
        HashSet::new(),
        None,
    )
    .await;

    let failed = store.failed_indices().await.unwrap();
    assert_eq!(failed, [3].into_iter().collect());

    // Second attempt succeeds; replay completed ∪ nothing, retry failed.
    echo.heal();
    let skip = store.completed_indices().await.unwrap();
    drive(engine(client, 0), &adapter, &store, skip, None).await;

    let all = store.read_all().await.unwrap();
    assert_eq!(all.len(), 6);
    assert!(all.iter().all(|r| r.error.is_none()));
    assert_eq!(all[3].fields["echo"], json!("poison3"));
    assert!(store.failed_indices().await.unwrap().is_empty());
}

#[tokio::test]
async fn parallel_run_reads_back_in_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path(), "parallel-order");
    store.init().await.unwrap();

    let adapter = MemoryAdapter::new(dataset(10));
    let client: Arc<dyn CompletionClient> = Arc::new(EchoClient::new());

    let engine = Arc::new(Engine::new(
        client,
        "echo {word}",
        CompletionParams::new("stub"),
        EngineConfig {
            mode: EngineMode::Parallel,
            concurrency: 4,
            ..Default::default()
        },
    ));
    drive(engine, &adapter, &store, HashSet::new(), None).await;

    let all = store.read_all().await.unwrap();
    let indices: Vec<u64> = all.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
}
