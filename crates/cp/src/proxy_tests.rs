// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::api::AppState;
use crate::placement::{Placement, PlacementConfig};
use crate::pool::WorkerPool;
use crate::registry::{Registry, RegistryOptions};
use sbx_core::test_support::{heartbeat, sandbox_config};
use sbx_core::{OrgId, Region, SystemClock, WorkerId};
use sbx_store::{FileStore, SessionStore};
use std::sync::Arc;
use yare::parameterized;

#[parameterized(
    plain = { "sbx-0001.sandboxes.test", Some("sbx-0001") },
    with_port = { "sbx-0001.sandboxes.test:443", Some("sbx-0001") },
    apex = { "sandboxes.test", None },
    nested_label = { "a.b.sandboxes.test", None },
    other_domain = { "sbx-0001.elsewhere.test", None },
    empty_label = { ".sandboxes.test", None },
)]
fn host_parsing(host: &str, expected: Option<&str>) {
    let parsed = parse_sandbox_host(host, "sandboxes.test");
    assert_eq!(parsed.map(|id| id.to_string()), expected.map(String::from));
}

struct Fixture {
    state: AppState<SystemClock>,
    store: Arc<FileStore>,
}

fn fixture() -> Fixture {
    let store: Arc<FileStore> = Arc::new(FileStore::in_memory());
    let registry = Registry::new(WorkerPool::new(), SystemClock, RegistryOptions::default());
    let placement = Arc::new(Placement::new(
        registry.clone(),
        store.clone() as Arc<dyn SessionStore>,
        SystemClock,
        PlacementConfig {
            default_region: Region::new("r1"),
            org_limit: 10,
            token_secret: "s".to_string(),
            sandbox_domain: "sandboxes.test".to_string(),
        },
    ));
    let state = AppState::new(
        placement,
        registry,
        store.clone() as Arc<dyn SessionStore>,
        "sandboxes.test".to_string(),
    );
    Fixture { state, store }
}

async fn seeded_session(fx: &Fixture, id: &str, status: SessionStatus) -> SandboxId {
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
    if status != SessionStatus::Creating {
        fx.store
            .update_status(&sandbox_id, SessionStatus::Running, None)
            .await
            .unwrap();
    }
    if status != SessionStatus::Running && status != SessionStatus::Creating {
        fx.store.update_status(&sandbox_id, status, None).await.unwrap();
    }
    sandbox_id
}

fn request_for(id: &str, path: &str) -> Request {
    Request::builder()
        .uri(path)
        .header("host", format!("{id}.sandboxes.test"))
        .body(axum::body::Body::empty())
        .unwrap_or_default()
}

/// Serve a trivial upstream that echoes the Host header it saw.
async fn echo_upstream() -> String {
    let app = axum::Router::new().fallback(|headers: HeaderMap| async move {
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

async fn lost_upstream(body: &'static str) -> String {
    let app = axum::Router::new()
        .fallback(move || async move { (StatusCode::BAD_GATEWAY, body) });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr.to_string()
}

#[tokio::test]
async fn unknown_sandbox_is_404() {
    let fx = fixture();
    let response = handle_proxy(
        fx.state.clone(),
        SandboxId::from_string("sbx-none"),
        request_for("sbx-none", "/"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

async fn assert_terminal_410(status: SessionStatus) {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-t", status).await;
    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-t", "/")).await;
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn stopped_sandbox_is_410() {
    assert_terminal_410(SessionStatus::Stopped).await;
}

#[tokio::test]
async fn errored_sandbox_is_410() {
    assert_terminal_410(SessionStatus::Error).await;
}

#[tokio::test]
async fn hibernated_without_checkpoint_is_502_and_untouched() {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-h", SessionStatus::Hibernated).await;

    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-h", "/")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // Corruption must not mutate the session
    assert_eq!(
        fx.store.get_session(&id).await.unwrap().status,
        SessionStatus::Hibernated
    );
}

#[tokio::test]
async fn running_sandbox_proxies_with_host_preserved() {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-run", SessionStatus::Running).await;

    let upstream = echo_upstream().await;
    let mut beat = heartbeat("w1", "r1", 8, 1);
    beat.http_addr = upstream;
    fx.state.registry.upsert(beat);

    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-run", "/whoami")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(body.as_ref(), b"host=sbx-run.sandboxes.test");
}

#[tokio::test]
async fn lost_worker_without_checkpoint_is_410_and_stopped() {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-lost", SessionStatus::Running).await;
    // No registry entry for w1, no checkpoint

    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-lost", "/")).await;
    assert_eq!(response.status(), StatusCode::GONE);

    let session = fx.store.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.error.as_deref(), Some("worker lost"));
}

#[tokio::test]
async fn upstream_lost_body_marks_sandbox_stopped() {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-gone", SessionStatus::Running).await;

    let upstream = lost_upstream("sandbox not found on this worker").await;
    let mut beat = heartbeat("w1", "r1", 8, 1);
    beat.http_addr = upstream;
    fx.state.registry.upsert(beat);

    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-gone", "/")).await;
    assert_eq!(response.status(), StatusCode::GONE);
    assert_eq!(
        fx.store.get_session(&id).await.unwrap().status,
        SessionStatus::Stopped
    );
}

#[tokio::test]
async fn upstream_502_without_marker_passes_through() {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-502", SessionStatus::Running).await;

    let upstream = lost_upstream("internal flakiness").await;
    let mut beat = heartbeat("w1", "r1", 8, 1);
    beat.http_addr = upstream;
    fx.state.registry.upsert(beat);

    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-502", "/")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        fx.store.get_session(&id).await.unwrap().status,
        SessionStatus::Running,
        "a plain 502 is not a loss signal"
    );
}

#[tokio::test]
async fn unreachable_worker_is_502() {
    let fx = fixture();
    let id = seeded_session(&fx, "sbx-down", SessionStatus::Running).await;

    let mut beat = heartbeat("w1", "r1", 8, 1);
    beat.http_addr = "127.0.0.1:9".to_string(); // discard port, nothing listens
    fx.state.registry.upsert(beat);

    let response = handle_proxy(fx.state.clone(), id, request_for("sbx-down", "/")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
