// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire format tests: length-prefix framing and JSON encoding.

use super::*;
use sbx_core::{Fault, SandboxConfig, SandboxId};

#[test]
fn encode_returns_json_without_length_prefix() {
    let response = Response::Ok;
    let encoded = encode(&response).expect("encode failed");

    let json_str = std::str::from_utf8(&encoded).expect("should be valid UTF-8");
    assert!(json_str.starts_with('{'), "should be JSON object: {}", json_str);
}

#[tokio::test]
async fn read_write_message_roundtrip() {
    let original = b"hello world";

    let mut buffer = Vec::new();
    write_message(&mut buffer, original).await.expect("write failed");

    // write_message adds a 4-byte length prefix
    assert_eq!(buffer.len(), 4 + original.len());

    let mut cursor = std::io::Cursor::new(buffer);
    let read_back = read_message(&mut cursor).await.expect("read failed");

    assert_eq!(read_back, original);
}

#[tokio::test]
async fn write_message_adds_length_prefix() {
    let data = b"test data";

    let mut buffer = Vec::new();
    write_message(&mut buffer, data).await.expect("write failed");

    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;

    assert_eq!(len, data.len());
    assert_eq!(&buffer[4..], data);
}

#[tokio::test]
async fn read_message_reports_closed_connection() {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let err = read_message(&mut cursor).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed));
}

#[tokio::test]
async fn read_message_rejects_oversized_frames() {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&u32::MAX.to_be_bytes());
    let mut cursor = std::io::Cursor::new(buffer);
    let err = read_message(&mut cursor).await.unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
}

#[tokio::test]
async fn request_frames_round_trip() {
    let request = Request::CreateSandbox {
        sandbox_id: SandboxId::from_string("sbx-0001"),
        config: SandboxConfig::new("base"),
    };

    let mut buffer = Vec::new();
    let payload = encode(&request).unwrap();
    write_message(&mut buffer, &payload).await.unwrap();

    let mut cursor = std::io::Cursor::new(buffer);
    let parsed = read_request(&mut cursor, std::time::Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(parsed, request);
}

#[test]
fn error_response_surfaces_fault() {
    let response = Response::Error { fault: Fault::gone("terminal") };
    let fault = response.into_result().unwrap_err();
    assert_eq!(fault.kind(), sbx_core::ErrorKind::Gone);

    assert!(Response::Pong.into_result().is_ok());
}
