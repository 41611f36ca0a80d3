// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Checkpoint blob storage.
//!
//! Keys are `{region}/{sandbox_id}/{unix_ts}.ckpt`; values are sparse
//! zstd archives. Concurrent puts never collide because the timestamp
//! namespaces each hibernate cycle.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob store for checkpoint artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Upload the file at `src` under `key`. Returns bytes stored.
    async fn put_file(&self, key: &str, src: &Path) -> Result<u64, ObjectStoreError>;

    /// Download `key` into `dest`. Returns bytes fetched.
    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// Filesystem-rooted object store for local deployments and tests.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Keys are forward-slash paths; reject traversal and absolutes.
    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_file(&self, key: &str, src: &Path) -> Result<u64, ObjectStoreError> {
        let dest = self.resolve(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::copy(src, &dest).await?)
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64, ObjectStoreError> {
        let src = self.resolve(key)?;
        if !fs::try_exists(&src).await? {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::copy(&src, dest).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "object_tests.rs"]
mod tests;
