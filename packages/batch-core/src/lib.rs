//! Processing core for batch LM jobs.
//!
//! Streams units from a dataset adapter through render → LM →
//! post-process, yields results through the engine, and checkpoints
//! every outcome for exact resume. Front ends (the interactive CLI and
//! the queue worker) drive the same engine; nothing here knows which one
//! is calling.

pub mod adapter;
pub mod adapters;
pub mod breaker;
pub mod checkpoint;
pub mod engine;
pub mod postprocess;
pub mod render;
pub mod types;

pub use adapter::{AdapterError, DatasetAdapter, UnitStream};
pub use adapters::{JsonlAdapter, MemoryAdapter};
pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use checkpoint::{CheckpointError, CheckpointStore, ProgressRecord};
pub use engine::{
    filter_pending, Engine, EngineConfig, EngineError, EngineEvent, EngineMode, EngineRunSummary,
};
pub use postprocess::PostProcessOptions;
pub use render::{render, required_fields, RenderError};
pub use types::{RowResult, Unit, UnitOutcome};
