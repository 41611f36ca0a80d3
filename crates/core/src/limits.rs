// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-sandbox resource limits.

use serde::{Deserialize, Serialize};

/// Resource envelope for one sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: u32,
    pub disk_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { memory_mb: 1024, cpus: 1, disk_mb: 4096 }
    }
}
