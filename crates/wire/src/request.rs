// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Requests sent from the control plane to a worker.

use sbx_core::{CheckpointRecord, Heartbeat, SandboxConfig, SandboxId};
use serde::{Deserialize, Serialize};

/// RPC request frame.
///
/// `Heartbeat` flows the other way — workers push it to the control
/// plane's ingest listener over the same framing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Version handshake.
    Hello { version: String },

    /// Connection-pool keepalive probe.
    Ping,

    /// Worker → control plane state push.
    Heartbeat { beat: Heartbeat },

    /// Create and start a sandbox on this worker. The control plane
    /// assigns the ID so the session row exists before the container.
    CreateSandbox {
        sandbox_id: SandboxId,
        config: SandboxConfig,
    },

    /// Stop and remove a sandbox. Idempotent.
    DestroySandbox { sandbox_id: SandboxId },

    /// Checkpoint a running sandbox to the object store.
    HibernateSandbox { sandbox_id: SandboxId },

    /// Restore a sandbox from a checkpoint onto this worker.
    WakeSandbox {
        sandbox_id: SandboxId,
        checkpoint: CheckpointRecord,
        timeout_secs: u64,
    },

    /// Whether this worker's deterministic TAP/port slot for the
    /// sandbox is free (snapshot restores need their original NIC).
    IsTapAvailable { sandbox_id: SandboxId },
}
