// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session store contract.
//!
//! The authoritative record of every sandbox. All writes are serialized
//! by the store; readers may race freely. Implementations enforce the
//! status transition rules of [`SessionStatus`] so no caller can
//! downgrade a terminal session.

use async_trait::async_trait;
use sbx_core::{
    CheckpointRecord, ErrorKind, Fault, Heartbeat, OrgId, Region, SandboxConfig, SandboxId,
    SessionRecord, SessionStatus, WorkerId,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(SandboxId),

    #[error("session {0} already exists")]
    AlreadyExists(SandboxId),

    #[error("no active checkpoint for {0}")]
    NoActiveCheckpoint(SandboxId),

    #[error("illegal transition {from} -> {to} for {sandbox_id}")]
    InvalidTransition {
        sandbox_id: SandboxId,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for Fault {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::NotFound(_) | StoreError::NoActiveCheckpoint(_) => ErrorKind::NotFound,
            StoreError::AlreadyExists(_) => ErrorKind::Invalid,
            StoreError::InvalidTransition { .. } => ErrorKind::Gone,
            StoreError::Io(_) | StoreError::Json(_) => ErrorKind::Invalid,
        };
        Fault::new(kind, err.to_string())
    }
}

/// Object-store key for a new checkpoint artifact.
pub fn checkpoint_key(region: &Region, sandbox_id: &SandboxId, unix_ts: u64) -> String {
    format!("{region}/{sandbox_id}/{unix_ts}.ckpt")
}

/// Transactional session + checkpoint + worker-key interface.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new session in `Creating`. Fails if the ID exists.
    async fn create_session(
        &self,
        sandbox_id: SandboxId,
        org_id: OrgId,
        worker_id: WorkerId,
        region: Region,
        config: &SandboxConfig,
    ) -> Result<SessionRecord, StoreError>;

    async fn get_session(&self, sandbox_id: &SandboxId) -> Result<SessionRecord, StoreError>;

    /// Idempotent status write; terminal states reject downgrades.
    async fn update_status(
        &self,
        sandbox_id: &SandboxId,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Move ownership to `worker_id` and flip to `Running` atomically.
    /// Used after a wake lands on a (possibly different) worker.
    async fn reassign_worker(
        &self,
        sandbox_id: &SandboxId,
        worker_id: WorkerId,
    ) -> Result<(), StoreError>;

    /// Append a checkpoint row and mark it active.
    async fn record_checkpoint(
        &self,
        sandbox_id: &SandboxId,
        blob_key: String,
        region: Region,
        size_bytes: u64,
    ) -> Result<CheckpointRecord, StoreError>;

    /// Clear "active" on the latest checkpoint.
    async fn mark_checkpoint_restored(&self, sandbox_id: &SandboxId) -> Result<(), StoreError>;

    async fn get_active_checkpoint(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<CheckpointRecord, StoreError>;

    /// Quota admission input.
    async fn count_active_by_org(&self, org_id: &OrgId) -> Result<usize, StoreError>;

    /// Worker startup recovery and lost-worker handling.
    async fn list_sessions_by_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Durable per-worker heartbeat key with TTL, scanned by the
    /// registry's reconcile sweep.
    async fn put_worker_key(&self, beat: Heartbeat, ttl: Duration) -> Result<(), StoreError>;

    /// Unexpired worker keys.
    async fn list_worker_keys(&self) -> Result<Vec<Heartbeat>, StoreError>;
}
