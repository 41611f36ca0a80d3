// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;
use std::fs;

fn round_trip(payload: &[u8]) -> (PackSummary, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload");
    let packed = dir.path().join("packed.ckpt");
    let restored = dir.path().join("restored");

    fs::write(&src, payload).unwrap();
    let summary = pack(&src, &packed).unwrap();
    let logical = unpack(&packed, &restored).unwrap();
    assert_eq!(logical, payload.len() as u64);
    (summary, fs::read(&restored).unwrap())
}

#[test]
fn dense_payload_round_trips() {
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8 + 1).collect();
    let (summary, restored) = round_trip(&payload);
    assert_eq!(restored, payload);
    assert_eq!(summary.logical_size, 10_000);
    // 10_000 bytes = two full blocks + one partial, all non-zero
    assert_eq!(summary.blocks, 3);
}

#[test]
fn zero_blocks_are_not_stored() {
    let mut payload = vec![0u8; 64 * 1024];
    payload[0] = 0xAB;
    payload[40_000] = 0xCD;
    let (summary, restored) = round_trip(&payload);
    assert_eq!(restored, payload);
    assert_eq!(summary.blocks, 2);
}

#[test]
fn all_zero_payload_stores_no_blocks() {
    let payload = vec![0u8; 32 * 1024];
    let (summary, restored) = round_trip(&payload);
    assert_eq!(restored, payload);
    assert_eq!(summary.blocks, 0);
}

#[test]
fn empty_payload_round_trips() {
    let (summary, restored) = round_trip(&[]);
    assert!(restored.is_empty());
    assert_eq!(summary.logical_size, 0);
    assert_eq!(summary.blocks, 0);
}

#[test]
fn unaligned_tail_round_trips() {
    let mut payload = vec![0u8; 4096 + 17];
    payload[4096 + 16] = 0x7F;
    let (summary, restored) = round_trip(&payload);
    assert_eq!(restored, payload);
    assert_eq!(summary.blocks, 1);
}

#[test]
fn sparse_encoding_shrinks_mostly_zero_payloads() {
    let mut payload = vec![0u8; 1024 * 1024];
    for b in payload.iter_mut().take(4096) {
        *b = 0x42;
    }
    let (summary, _) = round_trip(&payload);
    assert!(
        summary.packed_size < 64 * 1024,
        "1 MiB of mostly zeros packed to {} bytes",
        summary.packed_size
    );
}

#[test]
fn garbage_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("bogus");
    fs::write(&bogus, b"not an archive at all").unwrap();
    let dest = dir.path().join("out");
    assert!(unpack(&bogus, &dest).is_err());
}

#[test]
fn wrong_magic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrong.ckpt");
    let file = fs::File::create(&path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(file, 3).unwrap();
    std::io::Write::write_all(&mut enc, b"XXXXXXXX\0\0\0\0\0\0\0\0").unwrap();
    enc.finish().unwrap();

    let err = unpack(&path, &dir.path().join("out")).unwrap_err();
    assert!(matches!(err, ArchiveError::Corrupt(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn arbitrary_payloads_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..20_000)) {
        let (_, restored) = round_trip(&payload);
        prop_assert_eq!(restored, payload);
    }
}
