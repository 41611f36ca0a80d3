// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    not_found = { ErrorKind::NotFound, "not_found" },
    gone = { ErrorKind::Gone, "gone" },
    busy = { ErrorKind::Busy, "busy" },
    no_capacity = { ErrorKind::NoCapacity, "no_capacity" },
    upstream = { ErrorKind::UpstreamUnreachable, "upstream_unreachable" },
    checkpoint = { ErrorKind::CheckpointFailed, "checkpoint_failed" },
    restore = { ErrorKind::RestoreFailed, "restore_failed" },
    timeout = { ErrorKind::Timeout, "timeout" },
    quota = { ErrorKind::QuotaExceeded, "quota_exceeded" },
    invalid = { ErrorKind::Invalid, "invalid" },
)]
fn kind_display_matches_wire_form(kind: ErrorKind, expected: &str) {
    assert_eq!(kind.to_string(), expected);
    let json = serde_json::to_string(&kind).unwrap();
    assert_eq!(json, format!("\"{expected}\""));
}

#[test]
fn fault_display_includes_kind_and_message() {
    let fault = Fault::gone("sandbox sbx-1 is stopped");
    assert_eq!(fault.to_string(), "gone: sandbox sbx-1 is stopped");
    assert_eq!(fault.kind(), ErrorKind::Gone);
}

#[test]
fn fault_round_trips_through_json() {
    let fault = Fault::no_capacity("region r1 exhausted");
    let json = serde_json::to_string(&fault).unwrap();
    let back: Fault = serde_json::from_str(&json).unwrap();
    assert_eq!(back, fault);
}
