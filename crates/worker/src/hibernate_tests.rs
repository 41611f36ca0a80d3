// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use sbx_core::test_support::sandbox_config;
use sbx_core::{ErrorKind, FakeClock, MachineId, OrgId, Region, ResourceLimits, WorkerId};
use sbx_runtime::{FakeRuntime, RuntimeError};
use sbx_store::{FileStore, FsObjectStore};

struct Fixture {
    _dir: tempfile::TempDir,
    hibernator: Hibernator<FakeClock>,
    runtime: FakeRuntime,
    store: Arc<FileStore<FakeClock>>,
    clock: FakeClock,
}

fn config(dir: &std::path::Path, worker: &str) -> WorkerConfig {
    WorkerConfig {
        worker_id: WorkerId::new(worker),
        machine_id: MachineId::from_string(format!("mch-{worker}")),
        region: Region::new("r1"),
        rpc_addr: "127.0.0.1:0".to_string(),
        http_addr: "127.0.0.1:0".to_string(),
        capacity: 8,
        data_dir: dir.to_path_buf(),
        default_limits: ResourceLimits::default(),
        image_prefix: "sbx-".to_string(),
    }
}

fn fixture(worker: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let runtime = FakeRuntime::new();
    let store = Arc::new(FileStore::with_clock(clock.clone()));
    let objects = Arc::new(FsObjectStore::new(dir.path().join("blobs")));
    let hibernator = Hibernator::new(
        config(dir.path(), worker),
        Arc::new(runtime.clone()),
        store.clone(),
        objects,
        clock.clone(),
    );
    Fixture { _dir: dir, hibernator, runtime, store, clock }
}

async fn running_sandbox(fx: &Fixture, id: &str, payload: &[u8]) -> SandboxId {
    let sandbox_id = SandboxId::from_string(id);
    fx.store
        .create_session(
            sandbox_id,
            OrgId::new("org-1"),
            WorkerId::new("w1"),
            Region::new("r1"),
            &sandbox_config(300, 3600),
        )
        .await
        .unwrap();
    fx.store
        .update_status(&sandbox_id, SessionStatus::Running, None)
        .await
        .unwrap();
    fx.runtime
        .create(&sbx_runtime::SandboxSpec {
            sandbox_id,
            image: "sbx-base:latest".to_string(),
            limits: Default::default(),
            env: Default::default(),
        })
        .await
        .unwrap();
    fx.runtime.start(&sandbox_id).await.unwrap();
    fx.runtime.set_payload(&sandbox_id, payload.to_vec());
    sandbox_id
}

#[tokio::test]
async fn hibernate_uploads_and_flips_status() {
    let fx = fixture("w1");
    let id = running_sandbox(&fx, "sbx-h", b"workspace").await;

    let result = fx.hibernator.hibernate(&id).await.unwrap();
    assert!(result.checkpoint_key.starts_with("r1/sbx-h/"));
    assert!(result.checkpoint_key.ends_with(".ckpt"));
    assert!(result.size_bytes > 0);

    let session = fx.store.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Hibernated);

    let checkpoint = fx.store.get_active_checkpoint(&id).await.unwrap();
    assert_eq!(checkpoint.blob_key, result.checkpoint_key);
    assert_eq!(checkpoint.size_bytes, result.size_bytes);

    // Capacity freed: the container is gone
    assert!(!fx.runtime.container_exists(&id));
}

#[tokio::test]
async fn wake_round_trips_payload_and_reassigns() {
    let fx = fixture("w1");
    let id = running_sandbox(&fx, "sbx-w", b"precious bytes").await;
    fx.hibernator.hibernate(&id).await.unwrap();
    let checkpoint = fx.store.get_active_checkpoint(&id).await.unwrap();

    // Wake on a different worker
    let fx2 = {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(FsObjectStore::new(
            fx._dir.path().join("blobs"), // shared object store
        ));
        Hibernator::new(
            config(dir.path(), "w2"),
            Arc::new(fx.runtime.clone()),
            fx.store.clone(),
            objects,
            fx.clock.clone(),
        )
    };

    let spec = sbx_runtime::SandboxSpec {
        sandbox_id: id,
        image: "sbx-base:latest".to_string(),
        limits: Default::default(),
        env: Default::default(),
    };
    fx2.wake(&id, &checkpoint, spec, Duration::from_secs(90))
        .await
        .unwrap();

    let session = fx.store.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.worker_id, Some(WorkerId::new("w2")));

    assert_eq!(fx.runtime.payload(&id).unwrap(), b"precious bytes");
    assert!(fx.runtime.is_running(&id));

    // Checkpoint consumed
    assert!(fx.store.get_active_checkpoint(&id).await.is_err());
}

#[tokio::test]
async fn checkpoint_failure_leaves_session_running() {
    let fx = fixture("w1");
    let id = running_sandbox(&fx, "sbx-f", b"data").await;
    fx.runtime
        .fail_next("checkpoint", RuntimeError::CheckpointFailed("criu broke".into()));

    let fault = fx.hibernator.hibernate(&id).await.unwrap_err();
    assert_eq!(fault.kind(), ErrorKind::CheckpointFailed);

    let session = fx.store.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert!(fx.store.get_active_checkpoint(&id).await.is_err());
}

#[tokio::test]
async fn wake_with_missing_blob_is_not_found() {
    let fx = fixture("w1");
    let id = running_sandbox(&fx, "sbx-m", b"data").await;
    fx.hibernator.hibernate(&id).await.unwrap();
    let mut checkpoint = fx.store.get_active_checkpoint(&id).await.unwrap();
    checkpoint.blob_key = "r1/sbx-m/9999999999.ckpt".to_string();

    let spec = sbx_runtime::SandboxSpec {
        sandbox_id: id,
        image: "sbx-base:latest".to_string(),
        limits: Default::default(),
        env: Default::default(),
    };
    let fault = fx
        .hibernator
        .wake(&id, &checkpoint, spec, Duration::from_secs(90))
        .await
        .unwrap_err();
    assert_eq!(fault.kind(), ErrorKind::NotFound);

    // Session untouched by the failed wake
    let session = fx.store.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Hibernated);
}

#[tokio::test]
async fn restore_failure_propagates_kind() {
    let fx = fixture("w1");
    let id = running_sandbox(&fx, "sbx-r", b"data").await;
    fx.hibernator.hibernate(&id).await.unwrap();
    let checkpoint = fx.store.get_active_checkpoint(&id).await.unwrap();

    fx.runtime
        .fail_next("restore", RuntimeError::RestoreFailed("bad image".into()));
    let spec = sbx_runtime::SandboxSpec {
        sandbox_id: id,
        image: "sbx-base:latest".to_string(),
        limits: Default::default(),
        env: Default::default(),
    };
    let fault = fx
        .hibernator
        .wake(&id, &checkpoint, spec, Duration::from_secs(90))
        .await
        .unwrap_err();
    assert_eq!(fault.kind(), ErrorKind::RestoreFailed);
    assert_eq!(
        fx.store.get_session(&id).await.unwrap().status,
        SessionStatus::Hibernated
    );
}
