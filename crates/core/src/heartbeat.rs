// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker heartbeat payload.

use crate::{MachineId, Region, WorkerId};
use serde::{Deserialize, Serialize};

/// Compact worker snapshot published every heartbeat interval.
///
/// The registry upserts entries from these; the same shape is written
/// under a durable per-worker key (30 s TTL) for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub machine_id: MachineId,
    pub region: Region,
    /// Framed-JSON RPC endpoint for lifecycle calls.
    pub rpc_addr: String,
    /// Data-plane HTTP endpoint the proxy forwards to.
    pub http_addr: String,
    pub capacity: u32,
    pub current: u32,
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

impl Heartbeat {
    /// Remaining sandbox slots on this worker.
    pub fn free_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.current)
    }

    /// Whether placement may admit a new sandbox here.
    ///
    /// Headroom plus cpu/mem below 90% — the admission gate; scale-up
    /// decisions use count-based utilization separately.
    pub fn admits(&self, need: u32) -> bool {
        self.free_capacity() >= need && self.cpu_pct < 90.0 && self.mem_pct < 90.0
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
