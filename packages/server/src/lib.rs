//! Control-plane side of the batch platform.
//!
//! Persists jobs and usage, queues tasks in Postgres, and runs the
//! worker loop that leases tasks and drives the processing engine. The
//! HTTP surface itself lives elsewhere; this crate exposes the stores,
//! the queue, the admission policy, and the worker.

pub mod admission;
pub mod config;
pub mod credentials;
pub mod jobs;
pub mod queue;
pub mod runner;
pub mod storage;
pub mod tasks;
pub mod usage;
pub mod worker;

pub use admission::{AdmissionPolicy, DenyReason};
pub use config::Config;
pub use credentials::CredentialCipher;
pub use jobs::{JobRecord, JobStatus, JobStore};
pub use queue::{EnqueueResult, PostgresTaskQueue};
pub use runner::{RunnerConfig, TaskError, TaskRunner};
pub use storage::{BlobStore, LocalBlobStore};
pub use tasks::{FailureKind, PayloadDefaults, TaskPayload, TaskPriority, TaskRecord, TaskStatus};
pub use usage::{UsageLedger, UsageTotals};
pub use worker::{TaskWorker, TaskWorkerConfig};
