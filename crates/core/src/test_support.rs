// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builders and fixtures shared by other crates' tests.

use crate::{
    Heartbeat, MachineId, OrgId, Region, SandboxConfig, SessionRecord, SessionStatus,
    TimeoutPolicy, WorkerId,
};

/// A running session record with short timeouts, owned by worker `w1`.
pub fn session_record(sandbox_id: &str) -> SessionRecord {
    SessionRecord {
        sandbox_id: sandbox_id.into(),
        org_id: OrgId::new("org-test"),
        template: "base".to_string(),
        region: Region::new("r1"),
        worker_id: Some(WorkerId::new("w1")),
        status: SessionStatus::Running,
        idle_seconds: 300,
        max_seconds: 3600,
        on_timeout: TimeoutPolicy::Hibernate,
        created_at_ms: 1_700_000_000_000,
        last_active_at_ms: 1_700_000_000_000,
        error: None,
    }
}

/// A sandbox config with explicit timeouts.
pub fn sandbox_config(idle_seconds: u64, max_seconds: u64) -> SandboxConfig {
    SandboxConfig {
        idle_seconds,
        max_seconds,
        ..SandboxConfig::new("base")
    }
}

/// A healthy heartbeat for `worker_id` in `region`.
pub fn heartbeat(worker_id: &str, region: &str, capacity: u32, current: u32) -> Heartbeat {
    Heartbeat {
        worker_id: WorkerId::new(worker_id),
        machine_id: MachineId::from_string(format!("mch-{worker_id}")),
        region: Region::new(region),
        rpc_addr: format!("127.0.0.1:7{}70", worker_id.len()),
        http_addr: format!("127.0.0.1:7{}71", worker_id.len()),
        capacity,
        current,
        cpu_pct: 10.0,
        mem_pct: 20.0,
    }
}
