//! Processing engine.
//!
//! Drives units through render → LM → post-process and yields result
//! events to the caller. Two modes: sequential (one unit at a time, in
//! source order) and parallel (bounded by a semaphore, submission in
//! source order, yield in completion order). A shared circuit breaker
//! suspends dispatch after a streak of fatal failures; the caller either
//! resets and resumes or cancels.
//!
//! ```text
//! Engine::run
//!     │
//!     ├─► render prompt        (render error ⇒ terminal unit result)
//!     ├─► client.complete      (fatal / exhausted ⇒ terminal, breaker-counted)
//!     ├─► postprocess          (parse error ⇒ retry up to budget, then marker)
//!     └─► EngineEvent::Result  (completion order in parallel mode)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use llm_client::{CompletionClient, CompletionParams, Usage};

use crate::adapter::{AdapterError, UnitStream};
use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::postprocess::{self, PostProcessOptions};
use crate::render;
use crate::types::{RowResult, Unit, UnitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Sequential,
    Parallel,
}

/// All engine tunables, enumerated. Unknown settings do not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mode: EngineMode,
    /// Bound on overlapping LM calls. Parallel mode only.
    pub concurrency: usize,
    /// Additional LM calls allowed when the structured parse fails.
    pub parse_retries: u32,
    /// Consecutive fatal failures before dispatch suspends. 0 disables.
    pub breaker_threshold: u32,
    pub post_process: PostProcessOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Sequential,
            concurrency: 10,
            parse_retries: 2,
            breaker_threshold: 5,
            post_process: PostProcessOptions::default(),
        }
    }
}

/// What the engine yields while running.
#[derive(Debug)]
pub enum EngineEvent {
    Result(RowResult),
    /// Dispatch is suspended. The caller resets the breaker and calls
    /// [`Engine::resume_after_trip`], or cancels the run.
    BreakerTripped(BreakerSnapshot),
}

/// Terminal accounting for one engine run.
#[derive(Debug, Default, Clone)]
pub struct EngineRunSummary {
    pub succeeded: u64,
    pub parse_failed: u64,
    pub failed: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub cancelled: bool,
}

impl EngineRunSummary {
    pub fn total(&self) -> u64 {
        self.succeeded + self.parse_failed + self.failed
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The source failed mid-stream. Unit-less; aborts the run.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The event receiver went away.
    #[error("engine event receiver dropped")]
    ChannelClosed,
}

/// Per-unit pipeline, shared by both modes and every spawned task.
struct UnitExecutor {
    client: Arc<dyn CompletionClient>,
    template: String,
    params: CompletionParams,
    parse_retries: u32,
    post_process: PostProcessOptions,
    breaker: Arc<CircuitBreaker>,
}

impl UnitExecutor {
    async fn execute(&self, unit: Unit) -> RowResult {
        let prompt = match render::render(&self.template, &unit) {
            Ok(prompt) => prompt,
            Err(e) => {
                // Never dispatched to the LM; not breaker-counted.
                debug!(unit = unit.index, error = %e, "render failed");
                return RowResult::failed(unit, e.to_string(), 0);
            }
        };

        let mut attempts = 0u32;
        let mut usage_total = Usage::default();

        loop {
            attempts += 1;
            match self.client.complete(&prompt, &self.params).await {
                Ok(completion) => {
                    self.breaker.record_success();
                    usage_total.prompt_tokens += completion.usage.prompt_tokens;
                    usage_total.completion_tokens += completion.usage.completion_tokens;
                    usage_total.total_tokens += completion.usage.total_tokens;
                    usage_total.cost_usd += completion.usage.cost_usd;
                    usage_total.priced |= completion.usage.priced;

                    let mut result = RowResult::completed(
                        unit.clone(),
                        completion.text,
                        usage_total,
                        attempts,
                    );
                    postprocess::process(&mut result, &self.post_process);

                    if result.parse_error.is_some() && attempts <= self.parse_retries {
                        debug!(unit = unit.index, attempts, "parse failed, retrying");
                        continue;
                    }
                    if result.parse_error.is_some() && self.parse_retries > 0 {
                        result.retries_exhausted = Some(true);
                    }
                    return result;
                }
                Err(e) => {
                    // Fatal outright, or retryable with the client's budget
                    // spent. Both are terminal here and breaker-counted.
                    self.breaker.record_failure(&e.to_string(), unit.index);
                    return RowResult::failed(unit, e.to_string(), attempts);
                }
            }
        }
    }
}

pub struct Engine {
    executor: Arc<UnitExecutor>,
    breaker: Arc<CircuitBreaker>,
    config: EngineConfig,
    cancel: CancellationToken,
    resume: Arc<Notify>,
}

impl Engine {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        template: impl Into<String>,
        params: CompletionParams,
        config: EngineConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_threshold));
        let executor = Arc::new(UnitExecutor {
            client,
            template: template.into(),
            params,
            parse_retries: config.parse_retries,
            post_process: config.post_process,
            breaker: breaker.clone(),
        });
        Self {
            executor,
            breaker,
            config,
            cancel: CancellationToken::new(),
            resume: Arc::new(Notify::new()),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wake a run suspended on a breaker trip. Reset the breaker first;
    /// a wake-up with the breaker still tripped parks again.
    pub fn resume_after_trip(&self) {
        self.resume.notify_one();
    }

    /// Drive every unit of `units` through the pipeline, sending events
    /// to `events`. Returns when the stream is exhausted, the run is
    /// cancelled, or the source fails.
    pub async fn run(
        &self,
        units: UnitStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<EngineRunSummary, EngineError> {
        match self.config.mode {
            EngineMode::Sequential => self.run_sequential(units, events).await,
            EngineMode::Parallel => self.run_parallel(units, events).await,
        }
    }

    async fn run_sequential(
        &self,
        mut units: UnitStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<EngineRunSummary, EngineError> {
        let mut summary = EngineRunSummary::default();

        loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let Some(item) = units.next().await else {
                break;
            };
            let unit = item?;

            let result = self.executor.execute(unit).await;
            forward(&events, &mut summary, result).await?;

            if self.breaker.is_tripped() {
                events
                    .send(EngineEvent::BreakerTripped(self.breaker.status()))
                    .await
                    .map_err(|_| EngineError::ChannelClosed)?;
                if !self.wait_for_resume().await {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        Ok(summary)
    }

    async fn run_parallel(
        &self,
        units: UnitStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<EngineRunSummary, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set: JoinSet<RowResult> = JoinSet::new();
        let mut summary = EngineRunSummary::default();
        let mut units = units.fuse();
        let mut source_done = false;
        let mut adapter_error: Option<AdapterError> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }

                permit = semaphore.clone().acquire_owned(), if !source_done => {
                    let permit = permit.expect("engine semaphore closed");
                    match units.next().await {
                        Some(Ok(unit)) => {
                            let executor = self.executor.clone();
                            join_set.spawn(async move {
                                let result = executor.execute(unit).await;
                                drop(permit);
                                result
                            });
                        }
                        Some(Err(e)) => {
                            source_done = true;
                            adapter_error = Some(e);
                        }
                        None => {
                            source_done = true;
                        }
                    }
                }

                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok(result)) => {
                            forward(&events, &mut summary, result).await?;
                            if self.breaker.is_tripped()
                                && !self.suspend_parallel(&events, &mut summary, &mut join_set).await?
                            {
                                summary.cancelled = true;
                                break;
                            }
                        }
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "unit task aborted");
                            summary.failed += 1;
                        }
                        None => {}
                    }
                }

                else => break,
            }

            if source_done && join_set.is_empty() {
                break;
            }
        }

        // In-flight units never become silent: drain whatever is left,
        // after cancellation and source failure alike.
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => forward(&events, &mut summary, result).await?,
                Err(join_err) => {
                    warn!(error = %join_err, "unit task aborted");
                    summary.failed += 1;
                }
            }
        }

        if let Some(e) = adapter_error {
            return Err(e.into());
        }
        Ok(summary)
    }

    /// Surface the trip, keep forwarding in-flight completions, and wait
    /// for resume or cancellation. Returns false when cancelled.
    async fn suspend_parallel(
        &self,
        events: &mpsc::Sender<EngineEvent>,
        summary: &mut EngineRunSummary,
        join_set: &mut JoinSet<RowResult>,
    ) -> Result<bool, EngineError> {
        events
            .send(EngineEvent::BreakerTripped(self.breaker.status()))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        loop {
            tokio::select! {
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok(result)) => forward(events, summary, result).await?,
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "unit task aborted");
                            summary.failed += 1;
                        }
                        None => {}
                    }
                }
                _ = self.resume.notified() => {
                    if !self.breaker.is_tripped() {
                        return Ok(true);
                    }
                }
                _ = self.cancel.cancelled() => return Ok(false),
            }
        }
    }

    async fn wait_for_resume(&self) -> bool {
        loop {
            tokio::select! {
                _ = self.resume.notified() => {
                    if !self.breaker.is_tripped() {
                        return true;
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

/// Drop units whose indices are already checkpointed.
pub fn filter_pending(units: UnitStream, done: HashSet<u64>) -> UnitStream {
    Box::pin(units.filter(move |item| {
        let keep = match item {
            Ok(unit) => !done.contains(&unit.index),
            Err(_) => true,
        };
        futures::future::ready(keep)
    }))
}

async fn forward(
    events: &mpsc::Sender<EngineEvent>,
    summary: &mut EngineRunSummary,
    result: RowResult,
) -> Result<(), EngineError> {
    match result.outcome() {
        UnitOutcome::Succeeded => summary.succeeded += 1,
        UnitOutcome::ParseFailed => summary.parse_failed += 1,
        UnitOutcome::Failed => summary.failed += 1,
    }
    summary.prompt_tokens += u64::from(result.prompt_tokens.unwrap_or(0));
    summary.completion_tokens += u64::from(result.completion_tokens.unwrap_or(0));
    summary.cost_usd += result.cost_usd.unwrap_or(0.0);

    events
        .send(EngineEvent::Result(result))
        .await
        .map_err(|_| EngineError::ChannelClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DatasetAdapter;
    use crate::adapters::MemoryAdapter;
    use llm_client::{Completion, CompletionError, Result as LlmResult};
    use serde_json::{json, Map, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn units(texts: &[&str]) -> Vec<Map<String, Value>> {
        texts
            .iter()
            .map(|t| {
                let mut fields = Map::new();
                fields.insert("text".into(), json!(t));
                fields
            })
            .collect()
    }

    fn usage() -> Usage {
        Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost_usd: 0.001,
            priced: true,
        }
    }

    /// Responds from a fixed sequence, in call order.
    struct ScriptedClient {
        responses: Mutex<VecDeque<LlmResult<String>>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(responses: Vec<LlmResult<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, _prompt: &str, _params: &CompletionParams) -> LlmResult<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("{}".to_string()));
            next.map(|text| Completion {
                text,
                usage: usage(),
            })
        }
    }

    /// Responds based on the prompt, with a latency derived from it.
    struct KeyedClient;

    #[async_trait::async_trait]
    impl CompletionClient for KeyedClient {
        async fn complete(&self, prompt: &str, _params: &CompletionParams) -> LlmResult<Completion> {
            // Prompts look like "n <index>"; later units answer faster.
            let index: u64 = prompt
                .split_whitespace()
                .last()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(40 - 3 * index.min(10))).await;
            Ok(Completion {
                text: format!("{{\"echo\": {index}}}"),
                usage: usage(),
            })
        }
    }

    async fn run_to_end(
        engine: Arc<Engine>,
        adapter: &MemoryAdapter,
    ) -> (Vec<RowResult>, EngineRunSummary) {
        let stream = adapter.read_units().await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(stream, tx).await }
        });

        let mut results = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Result(result) => results.push(result),
                EngineEvent::BreakerTripped(_) => {
                    engine.breaker().reset();
                    engine.resume_after_trip();
                }
            }
        }
        let summary = run.await.unwrap().unwrap();
        (results, summary)
    }

    #[tokio::test]
    async fn sequential_success_merges_parsed_fields() {
        let adapter = MemoryAdapter::new(units(&["hello", "world"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(r#"{"es": "hola"}"#.into()),
            Ok(r#"{"es": "mundo"}"#.into()),
        ]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "Translate '{text}' to Spanish",
            CompletionParams::new("stub"),
            EngineConfig::default(),
        ));

        let (results, summary) = run_to_end(engine, &adapter).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[0].fields["text"], json!("hello"));
        assert_eq!(results[0].fields["es"], json!("hola"));
        assert_eq!(results[1].fields["es"], json!("mundo"));
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn parse_retry_keeps_the_good_attempt() {
        let adapter = MemoryAdapter::new(units(&["hello"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("oops".into()),
            Ok(r#"{"es": "hola"}"#.into()),
        ]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "Translate '{text}'",
            CompletionParams::new("stub"),
            EngineConfig {
                parse_retries: 2,
                ..Default::default()
            },
        ));

        let (results, summary) = run_to_end(engine, &adapter).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fields["es"], json!("hola"));
        assert_eq!(results[0].attempts, Some(2));
        assert!(results[0].parse_error.is_none());
        assert!(results[0].retries_exhausted.is_none());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn parse_retry_budget_bounds_lm_calls() {
        let adapter = MemoryAdapter::new(units(&["hello"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("bad".into()),
            Ok("still bad".into()),
            Ok("worse".into()),
            Ok("never reached".into()),
        ]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig {
                parse_retries: 2,
                ..Default::default()
            },
        ));

        let (results, summary) = run_to_end(engine.clone(), &adapter).await;
        // Budget B ⇒ at most B+1 calls for the unit.
        assert_eq!(client.call_count(), 3);
        assert_eq!(results[0].parse_error.as_deref().is_some(), true);
        assert_eq!(results[0].retries_exhausted, Some(true));
        assert_eq!(results[0].result.as_deref(), Some("worse"));
        assert_eq!(summary.parse_failed, 1);
        // Parse failures never count toward the breaker.
        assert_eq!(engine.breaker().status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn render_error_never_reaches_the_lm() {
        let adapter = MemoryAdapter::new(units(&["hello"]));
        let client = Arc::new(ScriptedClient::new(vec![]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "needs {missing_field}",
            CompletionParams::new("stub"),
            EngineConfig::default(),
        ));

        let (results, summary) = run_to_end(engine.clone(), &adapter).await;
        assert_eq!(client.call_count(), 0);
        assert!(results[0].error.as_deref().unwrap().contains("missing_field"));
        assert_eq!(summary.failed, 1);
        assert_eq!(engine.breaker().status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn empty_input_completes_without_lm_calls() {
        let adapter = MemoryAdapter::new(Vec::new());
        let client = Arc::new(ScriptedClient::new(vec![]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig::default(),
        ));

        let (results, summary) = run_to_end(engine, &adapter).await;
        assert!(results.is_empty());
        assert_eq!(summary.total(), 0);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn breaker_trips_then_resume_finishes_the_run() {
        let adapter = MemoryAdapter::new(units(&["a", "b", "c", "d", "e"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Err(CompletionError::AuthRejected("bad key".into())),
            Err(CompletionError::AuthRejected("bad key".into())),
            Err(CompletionError::AuthRejected("bad key".into())),
            Ok(r#"{"v": 4}"#.into()),
            Ok(r#"{"v": 5}"#.into()),
        ]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig {
                breaker_threshold: 3,
                ..Default::default()
            },
        ));

        let stream = adapter.read_units().await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(stream, tx).await }
        });

        let mut results = Vec::new();
        let mut trips = 0;
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Result(result) => results.push(result),
                EngineEvent::BreakerTripped(snapshot) => {
                    trips += 1;
                    assert_eq!(snapshot.consecutive_failures, 3);
                    // Units 3 and 4 must not have been dispatched yet.
                    assert_eq!(client.call_count(), 3);
                    engine.breaker().reset();
                    engine.resume_after_trip();
                }
            }
        }

        let summary = run.await.unwrap().unwrap();
        assert_eq!(trips, 1);
        assert_eq!(results.len(), 5);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test]
    async fn breaker_trip_without_resume_cancels() {
        let adapter = MemoryAdapter::new(units(&["a", "b", "c"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Err(CompletionError::Forbidden("denied".into())),
            Err(CompletionError::Forbidden("denied".into())),
        ]));

        let engine = Arc::new(Engine::new(
            client,
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig {
                breaker_threshold: 2,
                ..Default::default()
            },
        ));

        let stream = adapter.read_units().await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(stream, tx).await }
        });

        let mut results = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Result(result) => results.push(result),
                EngineEvent::BreakerTripped(_) => engine.cancellation_token().cancel(),
            }
        }

        let summary = run.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retryable_errors_count_toward_the_breaker() {
        let adapter = MemoryAdapter::new(units(&["a", "b"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Err(CompletionError::RateLimited("slow down".into())),
            Ok(r#"{"ok": true}"#.into()),
        ]));

        let engine = Arc::new(Engine::new(
            client,
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig {
                breaker_threshold: 1,
                ..Default::default()
            },
        ));

        let (results, summary) = run_to_end(engine, &adapter).await;
        // First unit trips the breaker, the test harness resets, run ends.
        assert_eq!(results.len(), 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn parallel_mode_processes_every_unit() {
        let fields: Vec<Map<String, Value>> = (0..10)
            .map(|i| {
                let mut map = Map::new();
                map.insert("text".into(), json!(i.to_string()));
                map
            })
            .collect();
        let adapter = MemoryAdapter::new(fields);

        let engine = Arc::new(Engine::new(
            Arc::new(KeyedClient),
            "n {text}",
            CompletionParams::new("stub"),
            EngineConfig {
                mode: EngineMode::Parallel,
                concurrency: 4,
                ..Default::default()
            },
        ));

        let (results, summary) = run_to_end(engine, &adapter).await;
        assert_eq!(results.len(), 10);
        assert_eq!(summary.succeeded, 10);

        let mut indices: Vec<u64> = results.iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn parallel_with_concurrency_one_matches_sequential_output() {
        let input = units(&["x", "y", "z"]);
        let script = || {
            vec![
                Ok::<_, CompletionError>(r#"{"n": 1}"#.to_string()),
                Ok(r#"{"n": 2}"#.to_string()),
                Ok(r#"{"n": 3}"#.to_string()),
            ]
        };

        let sequential = {
            let adapter = MemoryAdapter::new(input.clone());
            let engine = Arc::new(Engine::new(
                Arc::new(ScriptedClient::new(script())),
                "{text}",
                CompletionParams::new("stub"),
                EngineConfig::default(),
            ));
            run_to_end(engine, &adapter).await.0
        };

        let parallel = {
            let adapter = MemoryAdapter::new(input);
            let engine = Arc::new(Engine::new(
                Arc::new(ScriptedClient::new(script())),
                "{text}",
                CompletionParams::new("stub"),
                EngineConfig {
                    mode: EngineMode::Parallel,
                    concurrency: 1,
                    ..Default::default()
                },
            ));
            run_to_end(engine, &adapter).await.0
        };

        let mut sequential_sorted = sequential;
        let mut parallel_sorted = parallel;
        sequential_sorted.sort_by_key(|r| r.index);
        parallel_sorted.sort_by_key(|r| r.index);
        assert_eq!(sequential_sorted, parallel_sorted);
    }

    #[tokio::test]
    async fn cancellation_before_start_dispatches_nothing() {
        let adapter = MemoryAdapter::new(units(&["a", "b"]));
        let client = Arc::new(ScriptedClient::new(vec![]));

        let engine = Arc::new(Engine::new(
            client.clone(),
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig::default(),
        ));
        engine.cancellation_token().cancel();

        let (results, summary) = run_to_end(engine, &adapter).await;
        assert!(results.is_empty());
        assert!(summary.cancelled);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn filter_pending_skips_checkpointed_indices() {
        let adapter = MemoryAdapter::new(units(&["a", "b", "c", "d"]));
        let stream = adapter.read_units().await.unwrap();
        let done: HashSet<u64> = [0, 2].into_iter().collect();

        let remaining: Vec<u64> = filter_pending(stream, done)
            .map(|item| item.unwrap().index)
            .collect()
            .await;
        assert_eq!(remaining, vec![1, 3]);
    }

    #[tokio::test]
    async fn usage_totals_cover_parse_retry_attempts() {
        let adapter = MemoryAdapter::new(units(&["hello"]));
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("bad".into()),
            Ok(r#"{"es": "hola"}"#.into()),
        ]));

        let engine = Arc::new(Engine::new(
            client,
            "{text}",
            CompletionParams::new("stub"),
            EngineConfig {
                parse_retries: 1,
                ..Default::default()
            },
        ));

        let (results, summary) = run_to_end(engine, &adapter).await;
        // Two successful LM calls, 10 prompt tokens each.
        assert_eq!(results[0].prompt_tokens, Some(20));
        assert_eq!(results[0].completion_tokens, Some(10));
        assert_eq!(summary.prompt_tokens, 20);
        assert!((summary.cost_usd - 0.002).abs() < 1e-9);
    }
}
