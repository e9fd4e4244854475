//! Dataset adapter contract.
//!
//! An adapter bridges one concrete dataset format to the engine's
//! unit/result abstraction: a lazy, finite unit stream on the read side
//! and a result writer on the sink side. Format-specific parsing beyond
//! JSONL lives outside the core; only the contract is fixed here.

use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::types::{RowResult, Unit};

/// Lazy unit sequence. Items surface adapter failures, which are
/// unit-less: the engine aborts the run rather than emitting a per-unit
/// error for them.
pub type UnitStream = Pin<Box<dyn Stream<Item = Result<Unit, AdapterError>> + Send>>;

/// Failures at the dataset boundary.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to open source: {0}")]
    Open(String),

    #[error("path escapes the adapter root: {0}")]
    PathPolicy(String),

    #[error("malformed record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("failed to write results: {0}")]
    Write(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source/sink over one dataset.
///
/// `read_units` is side-effect-free on the source and re-opening yields
/// the same sequence for the same input, which is what makes resume
/// possible. `write_results` is the only mutator of the sink and must
/// accept both one materialized call and incremental calls.
#[async_trait]
pub trait DatasetAdapter: Send + Sync {
    /// Units in source order, each carrying a distinct `_idx` from 0.
    async fn read_units(&self) -> Result<UnitStream, AdapterError>;

    /// Persist results in the order given.
    async fn write_results(&self, results: &[RowResult]) -> Result<(), AdapterError>;

    /// Best-effort field names for template validation. May be empty.
    async fn schema(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Confine `candidate` beneath `root` without touching the filesystem.
///
/// Rejects absolute candidates and any `..` component. Returns the joined
/// path on success.
pub fn confine(root: &Path, candidate: &Path) -> Result<PathBuf, AdapterError> {
    if candidate.is_absolute() {
        return Err(AdapterError::PathPolicy(candidate.display().to_string()));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(AdapterError::PathPolicy(candidate.display().to_string()));
            }
        }
    }
    Ok(root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_joined() {
        let path = confine(Path::new("/data"), Path::new("jobs/input.jsonl")).unwrap();
        assert_eq!(path, PathBuf::from("/data/jobs/input.jsonl"));
    }

    #[test]
    fn absolute_paths_are_rejected() {
        assert!(confine(Path::new("/data"), Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        assert!(confine(Path::new("/data"), Path::new("../secrets")).is_err());
        assert!(confine(Path::new("/data"), Path::new("a/../../b")).is_err());
    }

    #[test]
    fn current_dir_components_are_allowed() {
        let path = confine(Path::new("/data"), Path::new("./input.jsonl")).unwrap();
        assert_eq!(path, PathBuf::from("/data/./input.jsonl"));
    }
}
