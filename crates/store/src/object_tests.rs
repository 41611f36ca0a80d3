// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[tokio::test]
async fn put_get_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::new(dir.path().join("blobs"));

    let src = dir.path().join("artifact");
    tokio::fs::write(&src, b"checkpoint bytes").await.unwrap();

    let key = "r1/sbx-0001/1700000000.ckpt";
    let stored = store.put_file(key, &src).await.unwrap();
    assert_eq!(stored, 16);

    let dest = dir.path().join("fetched");
    let fetched = store.get_file(key, &dest).await.unwrap();
    assert_eq!(fetched, 16);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"checkpoint bytes");

    store.delete(key).await.unwrap();
    let err = store.get_file(key, &dest).await.unwrap_err();
    assert!(matches!(err, ObjectStoreError::NotFound(_)));
}

#[parameterized(
    empty = { "" },
    absolute = { "/etc/passwd" },
    traversal = { "r1/../../secrets" },
    dot_segment = { "r1/./x.ckpt" },
    empty_segment = { "r1//x.ckpt" },
)]
fn bad_keys_are_rejected(key: &str) {
    let store = FsObjectStore::new("/tmp/unused");
    assert!(matches!(store.resolve(key), Err(ObjectStoreError::InvalidKey(_))));
}

#[tokio::test]
async fn delete_missing_object_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::new(dir.path());
    let err = store.delete("r1/sbx-x/1.ckpt").await.unwrap_err();
    assert!(matches!(err, ObjectStoreError::NotFound(_)));
}
