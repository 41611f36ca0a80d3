// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Responses from worker to control plane.

use sbx_core::{Fault, SandboxId, SessionStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    /// Generic success.
    Ok,

    /// Keepalive reply.
    Pong,

    /// Version handshake reply.
    Hello { version: String },

    /// Classified failure; the kind maps onto the shared taxonomy.
    Error { fault: Fault },

    /// Sandbox created and running.
    SandboxCreated {
        sandbox_id: SandboxId,
        status: SessionStatus,
    },

    /// Checkpoint uploaded.
    Hibernated { checkpoint_key: String, size_bytes: u64 },

    /// Restore finished; sandbox running on this worker.
    Woken { status: SessionStatus },

    /// TAP slot probe result.
    TapAvailability { available: bool },
}

impl Response {
    /// Collapse into `Result`, surfacing `Error` frames as faults.
    pub fn into_result(self) -> Result<Response, Fault> {
        match self {
            Response::Error { fault } => Err(fault),
            other => Ok(other),
        }
    }
}
