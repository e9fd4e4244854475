//! Blob staging for job inputs and outputs.
//!
//! The control plane stores datasets in an object store; the worker only
//! needs fetch-to-path and store-from-path. The local-filesystem
//! implementation backs single-host deployments and tests; presigned-URL
//! stores are external collaborators behind the same trait.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use batch_core::adapter::confine;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy the blob at `key` to `dest`.
    async fn fetch(&self, key: &str, dest: &Path) -> Result<()>;

    /// Upload the file at `src` under `key`.
    async fn store(&self, src: &Path, key: &str) -> Result<()>;
}

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Ok(confine(&self.root, Path::new(key))?)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        let source = self.resolve(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, dest)
            .await
            .with_context(|| format!("failed to fetch blob `{key}`"))?;
        Ok(())
    }

    async fn store(&self, src: &Path, key: &str) -> Result<()> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, &target)
            .await
            .with_context(|| format!("failed to store blob `{key}`"))?;
        Ok(())
    }
}
