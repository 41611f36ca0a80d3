// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over a combined in-process deployment: a real
//! control plane (HTTP + ingest + registry) and real workers speaking
//! RPC, with the fake runtime and provider underneath.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sbx_core::test_support::sandbox_config;
use sbx_core::{
    Fault, MachineId, Region, ResourceLimits, SandboxId, SessionStatus, SystemClock, WorkerId,
};
use sbx_cp::{AutoscalerOptions, ControlPlane, ControlPlaneConfig, RegistryOptions};
use sbx_runtime::{FakeRuntime, RuntimeAdapter};
use sbx_store::{FileStore, FsObjectStore, SessionStore};
use sbx_worker::{LocalSink, RouterOptions, Worker, WorkerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DOMAIN: &str = "sandboxes.example";

struct Deployment {
    _dir: tempfile::TempDir,
    cp: ControlPlane<SystemClock>,
    workers: Vec<Worker<SystemClock>>,
    store: Arc<FileStore>,
    runtime: FakeRuntime,
}

/// Echo server standing in for the worker data plane.
async fn spawn_upstream() -> String {
    use axum::http::header;
    let app = axum::Router::new().fallback(|headers: axum::http::HeaderMap| async move {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        format!("host={host}")
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr.to_string()
}

async fn deploy(worker_count: usize) -> Deployment {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<FileStore> = Arc::new(FileStore::in_memory());
    let runtime = FakeRuntime::new();
    let upstream_addr = spawn_upstream().await;

    let cp = ControlPlane::start(
        ControlPlaneConfig {
            http_addr: "127.0.0.1:0".to_string(),
            ingest_addr: "127.0.0.1:0".to_string(),
            default_region: Region::new("r1"),
            sandbox_domain: DOMAIN.to_string(),
            org_limit: 16,
            token_secret: "spec-secret".to_string(),
            registry: RegistryOptions {
                sweep_interval: Duration::from_millis(200),
                evict_after_sweeps: 2,
            },
            autoscaler: AutoscalerOptions {
                interval: Duration::from_secs(3600), // driven manually in tests
                ..AutoscalerOptions::default()
            },
        },
        store.clone() as Arc<dyn SessionStore>,
        Arc::new(sbx_runtime::NullProvider),
        SystemClock,
    )
    .await
    .unwrap();

    let mut workers = Vec::new();
    for n in 0..worker_count {
        let worker_id = format!("w{}", n + 1);
        let config = WorkerConfig {
            worker_id: WorkerId::new(&worker_id),
            machine_id: MachineId::from_string(format!("mch-{worker_id}")),
            region: Region::new("r1"),
            rpc_addr: "127.0.0.1:0".to_string(),
            http_addr: upstream_addr.clone(),
            capacity: 8,
            data_dir: dir.path().join(&worker_id),
            default_limits: ResourceLimits::default(),
            image_prefix: "sbx-".to_string(),
        };
        let worker = Worker::start(
            config,
            store.clone() as Arc<dyn SessionStore>,
            Arc::new(FsObjectStore::new(dir.path().join("blobs"))),
            Arc::new(runtime.clone()),
            Arc::new(LocalSink::new(cp.heartbeat_tx())),
            SystemClock,
            RouterOptions::default(),
        )
        .await
        .unwrap();
        workers.push(worker);
    }

    // Heartbeats publish immediately; wait until the registry has them.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cp.registry().snapshot().len() < worker_count {
        assert!(tokio::time::Instant::now() < deadline, "workers never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Deployment { _dir: dir, cp, workers, store, runtime }
}

impl Deployment {
    fn api(&self) -> String {
        format!("http://{}", self.cp.http_addr())
    }

    async fn teardown(self) {
        for worker in self.workers {
            worker.shutdown(false).await;
        }
        self.cp.shutdown().await;
    }
}

/// Raw HTTP/1.1 request with an explicit Host header (subdomain path).
async fn get_with_host(addr: SocketAddr, host: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    // Read until the server closes; wake-on-request can take a moment.
    let _ = tokio::time::timeout(Duration::from_secs(120), stream.read_to_end(&mut raw))
        .await
        .expect("proxied response timed out");
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

async fn create_sandbox(
    deployment: &Deployment,
    body: serde_json::Value,
) -> (u16, serde_json::Value) {
    let response = reqwest::Client::new()
        .post(format!("{}/sandboxes", deployment.api()))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let body = response.json().await.unwrap_or(serde_json::Value::Null);
    (status, body)
}

async fn wait_for_status(
    store: &Arc<FileStore>,
    sandbox_id: &SandboxId,
    want: SessionStatus,
    within: Duration,
) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let status = store.get_session(sandbox_id).await.unwrap().status;
        if status == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sandbox never reached {want}, stuck at {status}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn create_use_destroy() {
    let deployment = deploy(1).await;
    let client = reqwest::Client::new();

    let (status, created) =
        create_sandbox(&deployment, serde_json::json!({ "template": "base", "timeout": 300 }))
            .await;
    assert_eq!(status, 201);
    let sandbox_id = created["sandbox_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "running");
    assert!(created["token"].as_str().unwrap().starts_with("v1."));
    assert!(created["connect_url"]
        .as_str()
        .unwrap()
        .contains(&format!("{sandbox_id}.{DOMAIN}")));

    let response = client
        .get(format!("{}/sandboxes/{sandbox_id}", deployment.api()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let fetched: serde_json::Value = response.json().await.unwrap();
    assert_eq!(fetched["status"], "running");
    assert_eq!(fetched["worker_id"], "w1");

    let response = client
        .delete(format!("{}/sandboxes/{sandbox_id}", deployment.api()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    // Idempotent repeat
    let response = client
        .delete(format!("{}/sandboxes/{sandbox_id}", deployment.api()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = client
        .get(format!("{}/sandboxes/{sandbox_id}", deployment.api()))
        .send()
        .await
        .unwrap();
    let fetched: serde_json::Value = response.json().await.unwrap();
    assert_eq!(fetched["status"], "stopped");

    deployment.teardown().await;
}

#[tokio::test]
async fn auto_hibernate_at_idle() {
    let deployment = deploy(1).await;

    let (status, created) = create_sandbox(
        &deployment,
        serde_json::json!({ "template": "base", "timeout": 1, "on_timeout": "hibernate" }),
    )
    .await;
    assert_eq!(status, 201);
    let sandbox_id = SandboxId::from_string(created["sandbox_id"].as_str().unwrap());
    deployment.runtime.set_payload(&sandbox_id, b"idle state".to_vec());

    wait_for_status(
        &deployment.store,
        &sandbox_id,
        SessionStatus::Hibernated,
        Duration::from_secs(10),
    )
    .await;

    let checkpoint = deployment.store.get_active_checkpoint(&sandbox_id).await.unwrap();
    assert!(checkpoint.blob_key.starts_with("r1/"));
    assert!(checkpoint.size_bytes > 0);

    deployment.teardown().await;
}

#[tokio::test]
async fn subdomain_wake_on_request() {
    let deployment = deploy(1).await;

    let (_, created) = create_sandbox(
        &deployment,
        serde_json::json!({ "template": "base", "timeout": 1, "on_timeout": "hibernate" }),
    )
    .await;
    let sandbox_id = SandboxId::from_string(created["sandbox_id"].as_str().unwrap());
    deployment.runtime.set_payload(&sandbox_id, b"wake state".to_vec());
    wait_for_status(
        &deployment.store,
        &sandbox_id,
        SessionStatus::Hibernated,
        Duration::from_secs(10),
    )
    .await;

    let host = format!("{sandbox_id}.{DOMAIN}");
    let (status, body) = get_with_host(deployment.cp.http_addr(), &host, "/health").await;
    assert_eq!(status, 200, "body: {body}");
    assert!(body.contains(&format!("host={host}")), "Host must be preserved: {body}");

    let session = deployment.store.get_session(&sandbox_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert!(session.worker_id.is_some());
    assert_eq!(deployment.runtime.payload(&sandbox_id).unwrap(), b"wake state");

    deployment.teardown().await;
}

#[tokio::test]
async fn lost_worker_recovers_from_checkpoint() {
    let deployment = deploy(2).await;

    // Sandbox runs on w1 and has a prior checkpoint
    let (_, created) = create_sandbox(
        &deployment,
        serde_json::json!({ "template": "base", "timeout": 300, "region": "r1" }),
    )
    .await;
    let sandbox_id = SandboxId::from_string(created["sandbox_id"].as_str().unwrap());
    let owner = WorkerId::new(created["worker_id"].as_str().unwrap());
    deployment.runtime.set_payload(&sandbox_id, b"survivor".to_vec());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/sandboxes/{sandbox_id}/hibernate", deployment.api()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Back to "running on the (soon dead) owner" with the checkpoint
    // still active, as after a worker crash between beats.
    deployment.store.reassign_worker(&sandbox_id, owner.clone()).await.unwrap();

    // Shut the owner down first so no further beats re-register it,
    // then drop it from the registry (simulating eviction).
    let mut workers = deployment.workers;
    let owner_pos = workers
        .iter()
        .position(|w| w.config().worker_id == owner)
        .unwrap();
    workers.remove(owner_pos).shutdown(false).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    deployment.cp.registry().remove(&owner);

    let host = format!("{sandbox_id}.{DOMAIN}");
    let (status, body) = get_with_host(deployment.cp.http_addr(), &host, "/data").await;
    assert_eq!(status, 200, "body: {body}");

    let session = deployment.store.get_session(&sandbox_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_ne!(session.worker_id, Some(owner), "must land on the surviving worker");
    assert_eq!(deployment.runtime.payload(&sandbox_id).unwrap(), b"survivor");

    for worker in workers {
        worker.shutdown(false).await;
    }
    deployment.cp.shutdown().await;
}

#[tokio::test]
async fn lost_worker_without_checkpoint_is_stopped() {
    let deployment = deploy(1).await;

    let (_, created) = create_sandbox(
        &deployment,
        serde_json::json!({ "template": "base", "timeout": 300 }),
    )
    .await;
    let sandbox_id = SandboxId::from_string(created["sandbox_id"].as_str().unwrap());
    let owner = WorkerId::new(created["worker_id"].as_str().unwrap());

    let mut workers = deployment.workers;
    workers.pop().unwrap().shutdown(false).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    deployment.cp.registry().remove(&owner);

    let host = format!("{sandbox_id}.{DOMAIN}");
    let (status, _) = get_with_host(deployment.cp.http_addr(), &host, "/").await;
    assert_eq!(status, 410);

    let session = deployment.store.get_session(&sandbox_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.error.as_deref(), Some("worker lost"));

    deployment.cp.shutdown().await;
}

#[tokio::test]
async fn no_capacity_creates_no_session_row() {
    let deployment = deploy(1).await;

    // Fill the worker's advertised capacity
    let mut beat = deployment.cp.registry().get(&WorkerId::new("w1")).unwrap();
    beat.current = beat.capacity;
    deployment.cp.registry().upsert(beat);

    let (status, body) =
        create_sandbox(&deployment, serde_json::json!({ "template": "base" })).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "no workers");

    deployment.teardown().await;
}

/// Scale-up decision table, driven directly against the autoscaler.
#[tokio::test]
async fn scale_up_launches_one_pending_machine() {
    use sbx_cp::{Autoscaler, Registry, WorkerPool};
    use sbx_runtime::{FakeProvider, MachineProvider};

    let registry = Registry::new(WorkerPool::new(), SystemClock, RegistryOptions::default());
    let provider = Arc::new(FakeProvider::new(vec![Region::new("r1")]));
    let autoscaler = Autoscaler::new(
        registry.clone(),
        provider.clone(),
        SystemClock,
        AutoscalerOptions::default(),
    );

    // Two workers, capacity 50, current 40 each: utilization 0.80
    registry.upsert(sbx_core::test_support::heartbeat("w1", "r1", 50, 40));
    registry.upsert(sbx_core::test_support::heartbeat("w2", "r1", 50, 40));

    autoscaler.evaluate().await;
    assert_eq!(provider.list().await.unwrap().len(), 1);
    assert_eq!(autoscaler.pending_count(&Region::new("r1")), 1);

    // Still pressured, but the pending launch gates further creates
    autoscaler.evaluate().await;
    autoscaler.evaluate().await;
    assert_eq!(provider.list().await.unwrap().len(), 1);
}

/// Two concurrent routed operations on one sandbox serialize: the
/// runtime call log shows no interleaving.
#[tokio::test]
async fn concurrent_routes_do_not_interleave() {
    let deployment = deploy(1).await;

    let (_, created) = create_sandbox(
        &deployment,
        serde_json::json!({ "template": "base", "timeout": 300 }),
    )
    .await;
    let sandbox_id = SandboxId::from_string(created["sandbox_id"].as_str().unwrap());

    deployment.runtime.hold_exec(Duration::from_millis(200));
    let router = deployment.workers[0].router().clone();
    let runtime = deployment.runtime.clone();

    let run = |label: &'static str| {
        let router = router.clone();
        let runtime = runtime.clone();
        async move {
            router
                .route(sandbox_id, label, || async move {
                    runtime
                        .exec(&sandbox_id, &[label.to_string()])
                        .await
                        .map(|_| ())
                        .map_err(Fault::from)
                })
                .await
        }
    };
    let (a, b) = tokio::join!(run("exec-a"), run("exec-b"));
    a.unwrap();
    b.unwrap();

    let execs = deployment.runtime.calls_of("exec");
    assert_eq!(execs.len(), 2);
    assert!(
        execs[1].started >= execs[0].ended,
        "second exec began before the first finished"
    );

    deployment.teardown().await;
}

/// A full hibernate/wake cycle preserves the bytes the runtime reports.
#[tokio::test]
async fn hibernate_wake_round_trip_preserves_bytes() {
    let deployment = deploy(2).await;
    let client = reqwest::Client::new();

    let (_, created) = create_sandbox(
        &deployment,
        serde_json::json!({ "template": "base", "timeout": 300 }),
    )
    .await;
    let sandbox_id = SandboxId::from_string(created["sandbox_id"].as_str().unwrap());
    deployment
        .runtime
        .set_payload(&sandbox_id, vec![7u8; 10_000]);
    let before = deployment.runtime.stats(&sandbox_id).await.unwrap().mem_bytes;

    let response = client
        .post(format!("{}/sandboxes/{sandbox_id}/hibernate", deployment.api()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let hibernated: serde_json::Value = response.json().await.unwrap();
    assert!(hibernated["size_bytes"].as_u64().unwrap() > 0);

    let response = client
        .post(format!("{}/sandboxes/{sandbox_id}/wake", deployment.api()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let woken: serde_json::Value = response.json().await.unwrap();
    assert_eq!(woken["status"], "running");

    let after = deployment.runtime.stats(&sandbox_id).await.unwrap().mem_bytes;
    assert_eq!(before, after, "visible bytes changed across hibernate/wake");

    deployment.teardown().await;
}
