// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn beat(capacity: u32, current: u32, cpu: f32, mem: f32) -> Heartbeat {
    Heartbeat {
        worker_id: WorkerId::new("w1"),
        machine_id: MachineId::from_string("mch-1"),
        region: Region::new("r1"),
        rpc_addr: "127.0.0.1:7070".to_string(),
        http_addr: "127.0.0.1:7071".to_string(),
        capacity,
        current,
        cpu_pct: cpu,
        mem_pct: mem,
    }
}

#[parameterized(
    headroom = { 10, 4, 20.0, 20.0, true },
    full = { 10, 10, 20.0, 20.0, false },
    over_committed = { 10, 12, 20.0, 20.0, false },
    cpu_pressure = { 10, 4, 95.0, 20.0, false },
    mem_pressure = { 10, 4, 20.0, 91.0, false },
    exactly_at_ninety = { 10, 4, 90.0, 20.0, false },
)]
fn admission_gate(capacity: u32, current: u32, cpu: f32, mem: f32, admits: bool) {
    assert_eq!(beat(capacity, current, cpu, mem).admits(1), admits);
}

#[test]
fn free_capacity_saturates() {
    assert_eq!(beat(4, 9, 0.0, 0.0).free_capacity(), 0);
    assert_eq!(beat(8, 3, 0.0, 0.0).free_capacity(), 5);
}

#[test]
fn heartbeat_json_field_names_are_stable() {
    let json = serde_json::to_value(beat(10, 2, 15.5, 30.0)).unwrap();
    for field in [
        "worker_id",
        "machine_id",
        "region",
        "rpc_addr",
        "http_addr",
        "capacity",
        "current",
        "cpu_pct",
        "mem_pct",
    ] {
        assert!(json.get(field).is_some(), "missing field {field}");
    }
}
