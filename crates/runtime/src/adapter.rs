// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container runtime contract.

use async_trait::async_trait;
use sbx_core::{ErrorKind, Fault, ResourceLimits, SandboxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Everything the runtime needs to create one sandbox container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub sandbox_id: SandboxId,
    /// Container image resolved from the session template.
    pub image: String,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
}

/// Live resource usage of one container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeStats {
    pub cpu_pct: f32,
    pub mem_bytes: u64,
    pub mem_limit: u64,
    pub pids: u32,
    pub net_in: u64,
    pub net_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The container no longer exists (died or was removed out of band).
    #[error("sandbox {0} not found in runtime")]
    NotFound(SandboxId),

    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("runtime operation timed out: {0}")]
    Timeout(String),

    #[error("runtime failure: {0}")]
    Failed(String),
}

impl From<RuntimeError> for Fault {
    fn from(err: RuntimeError) -> Self {
        let kind = match &err {
            RuntimeError::NotFound(_) => ErrorKind::NotFound,
            RuntimeError::CheckpointFailed(_) => ErrorKind::CheckpointFailed,
            RuntimeError::RestoreFailed(_) => ErrorKind::RestoreFailed,
            RuntimeError::Timeout(_) => ErrorKind::Timeout,
            RuntimeError::Failed(_) => ErrorKind::UpstreamUnreachable,
        };
        Fault::new(kind, err.to_string())
    }
}

/// Thin contract over the container runtime on one worker host.
///
/// `checkpoint` must be atomic from the caller's point of view: no
/// filesystem mutation of the sink is visible until it returns Ok.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    /// Create the container (pull + configure, not started).
    async fn create(&self, spec: &SandboxSpec) -> Result<(), RuntimeError>;

    async fn start(&self, sandbox_id: &SandboxId) -> Result<(), RuntimeError>;

    async fn stop(&self, sandbox_id: &SandboxId, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, sandbox_id: &SandboxId) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        sandbox_id: &SandboxId,
        command: &[String],
    ) -> Result<ExecResult, RuntimeError>;

    async fn stats(&self, sandbox_id: &SandboxId) -> Result<RuntimeStats, RuntimeError>;

    /// Checkpoint the process tree into a single artifact at `sink`.
    async fn checkpoint(&self, sandbox_id: &SandboxId, sink: &Path) -> Result<(), RuntimeError>;

    /// Restore a container from the artifact at `source` and start it.
    async fn restore(&self, sandbox_id: &SandboxId, source: &Path) -> Result<(), RuntimeError>;

    /// The host port publicly mapped for subdomain proxying.
    async fn host_port(&self, sandbox_id: &SandboxId) -> Result<u16, RuntimeError>;
}
