// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sandbox session data model.
//!
//! The authoritative copy of every record here lives in the session
//! store; workers and the control plane hold short-lived views.

use crate::{CheckpointId, OrgId, Region, ResourceLimits, SandboxId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Authoritative sandbox state.
///
/// Transitions are monotone from `Creating` through terminal `Stopped`,
/// except the `Running ↔ Hibernated` bounce which may repeat any number
/// of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Running,
    Hibernated,
    Stopped,
    Error,
}

impl SessionStatus {
    /// Terminal states reject any further transition (idempotent
    /// same-state writes are allowed by the store).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped)
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Creating => matches!(next, Running | Stopped | Error),
            Running => matches!(next, Hibernated | Stopped | Error),
            Hibernated => matches!(next, Running | Stopped | Error),
            // A failed sandbox can still be destroyed.
            Error => matches!(next, Stopped),
            Stopped => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Hibernated => "hibernated",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the router does when a sandbox times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Hibernate,
    Kill,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Hibernate
    }
}

/// Creation-time sandbox parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub template: String,
    /// Explicit region request; placement falls back to the request
    /// header region, then the deployment default.
    #[serde(default)]
    pub region: Option<Region>,
    /// Rolling idle window in seconds.
    pub idle_seconds: u64,
    /// Absolute lifetime cap in seconds.
    pub max_seconds: u64,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            region: None,
            idle_seconds: 300,
            max_seconds: 3600,
            on_timeout: TimeoutPolicy::default(),
            limits: ResourceLimits::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_seconds)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
    }
}

/// Durable record of one sandbox session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub sandbox_id: SandboxId,
    pub org_id: OrgId,
    pub template: String,
    pub region: Region,
    /// Current owner; changes after a wake onto another worker.
    pub worker_id: Option<WorkerId>,
    pub status: SessionStatus,
    pub idle_seconds: u64,
    pub max_seconds: u64,
    pub on_timeout: TimeoutPolicy,
    pub created_at_ms: u64,
    pub last_active_at_ms: u64,
    /// Failure reason, set alongside `Error` (and `Stopped` when the
    /// worker was lost).
    #[serde(default)]
    pub error: Option<String>,
}

impl SessionRecord {
    /// Active sandboxes count against org quota and worker capacity.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Creating | SessionStatus::Running | SessionStatus::Hibernated
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_seconds)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
    }
}

/// One checkpoint artifact row. A sandbox accumulates these over its
/// hibernate cycles; at most one is active (most recent unrestored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: CheckpointId,
    pub sandbox_id: SandboxId,
    /// Object-store key: `{region}/{sandbox_id}/{unix_ts}.ckpt`.
    pub blob_key: String,
    pub region: Region,
    pub size_bytes: u64,
    pub created_at_ms: u64,
    pub restored_at_ms: Option<u64>,
}

impl CheckpointRecord {
    pub fn is_active(&self) -> bool {
        self.restored_at_ms.is_none()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
