// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-component error taxonomy.
//!
//! Adapters keep their own `thiserror` enums internally and translate
//! into a [`Fault`] before crossing a component boundary, so callers
//! branch on [`ErrorKind`] without knowing which subsystem failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification shared by every component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Sandbox or checkpoint does not exist.
    NotFound,
    /// Sandbox reached a terminal state; non-recoverable.
    Gone,
    /// Per-sandbox mutex held by a conflicting op (non-blocking caller).
    Busy,
    /// No worker can accept a new sandbox in any candidate region.
    NoCapacity,
    /// Worker RPC failed or a TCP dial timed out.
    UpstreamUnreachable,
    /// Runtime adapter failed during hibernate.
    CheckpointFailed,
    /// Runtime adapter failed during wake.
    RestoreFailed,
    /// Caller deadline exceeded.
    Timeout,
    /// Org active-sandbox limit reached.
    QuotaExceeded,
    /// Bad input.
    Invalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Gone => "gone",
            ErrorKind::Busy => "busy",
            ErrorKind::NoCapacity => "no_capacity",
            ErrorKind::UpstreamUnreachable => "upstream_unreachable",
            ErrorKind::CheckpointFailed => "checkpoint_failed",
            ErrorKind::RestoreFailed => "restore_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure carried across component boundaries and the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Gone, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn no_capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoCapacity, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnreachable, message)
    }

    pub fn checkpoint_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CheckpointFailed, message)
    }

    pub fn restore_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RestoreFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
