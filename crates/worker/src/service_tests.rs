// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use sbx_core::test_support::sandbox_config;
use sbx_core::{MachineId, OrgId, Region, ResourceLimits, SystemClock, WorkerId};
use sbx_runtime::FakeRuntime;
use sbx_store::{FileStore, FsObjectStore};
use sbx_wire::{Request, Response};
use std::time::Duration;
use tokio::sync::mpsc;

struct Fixture {
    _dir: tempfile::TempDir,
    worker: Worker<SystemClock>,
    store: Arc<FileStore>,
    runtime: FakeRuntime,
}

fn worker_config(dir: &std::path::Path) -> WorkerConfig {
    WorkerConfig {
        worker_id: WorkerId::new("w1"),
        machine_id: MachineId::from_string("mch-w1"),
        region: Region::new("r1"),
        rpc_addr: "127.0.0.1:0".to_string(),
        http_addr: "127.0.0.1:0".to_string(),
        capacity: 4,
        data_dir: dir.to_path_buf(),
        default_limits: ResourceLimits::default(),
        image_prefix: "sbx-".to_string(),
    }
}

async fn start_worker(store: Arc<FileStore>, runtime: FakeRuntime) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(FsObjectStore::new(dir.path().join("blobs")));
    let (tx, _rx) = mpsc::channel(16);
    let worker = Worker::start(
        worker_config(dir.path()),
        store.clone() as Arc<dyn SessionStore>,
        objects,
        Arc::new(runtime.clone()),
        Arc::new(crate::heartbeat::LocalSink::new(tx)),
        SystemClock,
        RouterOptions::default(),
    )
    .await
    .unwrap();
    Fixture { _dir: dir, worker, store, runtime }
}

async fn rpc(fx: &Fixture, request: Request) -> Response {
    let addr = fx.worker.rpc_addr().to_string();
    sbx_wire::oneshot(&addr, &request, Duration::from_secs(5))
        .await
        .unwrap()
}

#[tokio::test]
async fn create_and_destroy_over_rpc() {
    let store = Arc::new(FileStore::in_memory());
    let runtime = FakeRuntime::new();
    let id = SandboxId::from_string("sbx-rpc");
    store
        .create_session(
            id,
            OrgId::new("org-1"),
            WorkerId::new("w1"),
            Region::new("r1"),
            &sandbox_config(300, 3600),
        )
        .await
        .unwrap();

    let fx = start_worker(store, runtime).await;

    let response = rpc(
        &fx,
        Request::CreateSandbox { sandbox_id: id, config: sandbox_config(300, 3600) },
    )
    .await;
    assert!(
        matches!(response, Response::SandboxCreated { status: SessionStatus::Running, .. }),
        "unexpected response: {response:?}"
    );
    assert!(fx.worker.router().has_slot(&id));
    assert!(fx.runtime.is_running(&id));
    assert_eq!(
        fx.store.get_session(&id).await.unwrap().status,
        SessionStatus::Running
    );

    // TAP slot for the live sandbox is held by it, so still available to itself
    let response = rpc(&fx, Request::IsTapAvailable { sandbox_id: id }).await;
    assert_eq!(response, Response::TapAvailability { available: true });

    let response = rpc(&fx, Request::DestroySandbox { sandbox_id: id }).await;
    assert_eq!(response, Response::Ok);
    assert!(!fx.worker.router().has_slot(&id));
    assert_eq!(
        fx.store.get_session(&id).await.unwrap().status,
        SessionStatus::Stopped
    );

    // Idempotent second destroy
    let response = rpc(&fx, Request::DestroySandbox { sandbox_id: id }).await;
    assert_eq!(response, Response::Ok);

    fx.worker.shutdown(false).await;
}

#[tokio::test]
async fn create_beyond_capacity_is_refused() {
    let store = Arc::new(FileStore::in_memory());
    let runtime = FakeRuntime::new();
    let fx = start_worker(store.clone(), runtime).await;

    for n in 0..4 {
        let id = SandboxId::from_string(format!("sbx-cap{n}"));
        store
            .create_session(
                id,
                OrgId::new("org-1"),
                WorkerId::new("w1"),
                Region::new("r1"),
                &sandbox_config(300, 3600),
            )
            .await
            .unwrap();
        let response = rpc(
            &fx,
            Request::CreateSandbox { sandbox_id: id, config: sandbox_config(300, 3600) },
        )
        .await;
        assert!(matches!(response, Response::SandboxCreated { .. }));
    }

    let overflow = SandboxId::from_string("sbx-cap4");
    store
        .create_session(
            overflow,
            OrgId::new("org-1"),
            WorkerId::new("w1"),
            Region::new("r1"),
            &sandbox_config(300, 3600),
        )
        .await
        .unwrap();
    let response = rpc(
        &fx,
        Request::CreateSandbox { sandbox_id: overflow, config: sandbox_config(300, 3600) },
    )
    .await;
    match response {
        Response::Error { fault } => assert_eq!(fault.kind(), sbx_core::ErrorKind::NoCapacity),
        other => panic!("expected capacity error, got {other:?}"),
    }

    fx.worker.shutdown(false).await;
}

#[tokio::test]
async fn hibernate_and_wake_over_rpc() {
    let store = Arc::new(FileStore::in_memory());
    let runtime = FakeRuntime::new();
    let id = SandboxId::from_string("sbx-hib");
    store
        .create_session(
            id,
            OrgId::new("org-1"),
            WorkerId::new("w1"),
            Region::new("r1"),
            &sandbox_config(300, 3600),
        )
        .await
        .unwrap();

    let fx = start_worker(store.clone(), runtime.clone()).await;
    rpc(
        &fx,
        Request::CreateSandbox { sandbox_id: id, config: sandbox_config(300, 3600) },
    )
    .await;
    runtime.set_payload(&id, b"live state".to_vec());

    let response = rpc(&fx, Request::HibernateSandbox { sandbox_id: id }).await;
    let checkpoint_key = match response {
        Response::Hibernated { checkpoint_key, size_bytes } => {
            assert!(size_bytes > 0);
            checkpoint_key
        }
        other => panic!("expected Hibernated, got {other:?}"),
    };
    assert_eq!(
        store.get_session(&id).await.unwrap().status,
        SessionStatus::Hibernated
    );

    let checkpoint = store.get_active_checkpoint(&id).await.unwrap();
    assert_eq!(checkpoint.blob_key, checkpoint_key);

    let response = rpc(
        &fx,
        Request::WakeSandbox { sandbox_id: id, checkpoint, timeout_secs: 90 },
    )
    .await;
    assert_eq!(response, Response::Woken { status: SessionStatus::Running });
    assert_eq!(runtime.payload(&id).unwrap(), b"live state");

    fx.worker.shutdown(false).await;
}

#[tokio::test]
async fn recovery_rebuilds_slots_for_surviving_containers() {
    let store = Arc::new(FileStore::in_memory());
    let runtime = FakeRuntime::new();

    let survivor = SandboxId::from_string("sbx-live");
    let casualty = SandboxId::from_string("sbx-dead");
    for id in [survivor, casualty] {
        store
            .create_session(
                id,
                OrgId::new("org-1"),
                WorkerId::new("w1"),
                Region::new("r1"),
                &sandbox_config(300, 3600),
            )
            .await
            .unwrap();
        store.update_status(&id, SessionStatus::Running, None).await.unwrap();
    }
    // Only the survivor's container exists at boot
    runtime
        .create(&sbx_runtime::SandboxSpec {
            sandbox_id: survivor,
            image: "sbx-base:latest".to_string(),
            limits: Default::default(),
            env: Default::default(),
        })
        .await
        .unwrap();
    runtime.start(&survivor).await.unwrap();

    let fx = start_worker(store.clone(), runtime).await;

    assert!(fx.worker.router().has_slot(&survivor));
    assert!(!fx.worker.router().has_slot(&casualty));
    let dead = store.get_session(&casualty).await.unwrap();
    assert_eq!(dead.status, SessionStatus::Error);
    assert_eq!(dead.error.as_deref(), Some("container lost at recovery"));

    fx.worker.shutdown(false).await;
}
