// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane HTTP API.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use sbx_core::{
    Clock, ErrorKind, Fault, OrgId, Region, SandboxConfig, SandboxId, SessionRecord,
    TimeoutPolicy,
};
use sbx_store::SessionStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::placement::{CreateOutcome, CreateRequest, Placement};
use crate::registry::Registry;

/// Header carrying the caller's org until real auth terminates here.
const ORG_HEADER: &str = "x-sbx-org";
/// Region hint inferred by the edge.
const REGION_HEADER: &str = "x-sbx-region";

pub struct AppState<C: Clock> {
    pub placement: Arc<Placement<C>>,
    pub registry: Registry<C>,
    pub store: Arc<dyn SessionStore>,
    pub sandbox_domain: String,
    /// Upstream client for the subdomain proxy (5 s dial timeout).
    pub http_client: reqwest::Client,
}

impl<C: Clock> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            placement: Arc::clone(&self.placement),
            registry: self.registry.clone(),
            store: Arc::clone(&self.store),
            sandbox_domain: self.sandbox_domain.clone(),
            http_client: self.http_client.clone(),
        }
    }
}

impl<C: Clock> AppState<C> {
    pub fn new(
        placement: Arc<Placement<C>>,
        registry: Registry<C>,
        store: Arc<dyn SessionStore>,
        sandbox_domain: String,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { placement, registry, store, sandbox_domain, http_client }
    }
}

/// API routes (the subdomain proxy wraps this router as middleware).
pub fn api_router<C: Clock>(state: AppState<C>) -> axum::Router {
    axum::Router::new()
        .route("/sandboxes", post(create_sandbox::<C>))
        .route("/sandboxes/{id}", get(get_sandbox::<C>).delete(destroy_sandbox::<C>))
        .route("/sandboxes/{id}/hibernate", post(hibernate_sandbox::<C>))
        .route("/sandboxes/{id}/wake", post(wake_sandbox::<C>))
        .route("/workers", get(list_workers::<C>))
        .route("/healthz", get(healthz))
        // Explicit fallback so the subdomain middleware (layered on
        // top) also sees requests whose path matches no API route.
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    template: String,
    #[serde(default)]
    region: Option<String>,
    /// Rolling idle timeout; `timeout` is the wire name clients use.
    #[serde(default = "default_idle", alias = "timeout")]
    idle_seconds: u64,
    #[serde(default = "default_max")]
    max_seconds: u64,
    #[serde(default)]
    on_timeout: Option<TimeoutPolicy>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_idle() -> u64 {
    300
}

fn default_max() -> u64 {
    3600
}

#[derive(Debug, Serialize)]
struct DiscoveryPayload {
    sandbox_id: SandboxId,
    status: String,
    region: Region,
    worker_id: Option<String>,
    connect_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn discovery(record: &SessionRecord, domain: &str, token: Option<String>) -> DiscoveryPayload {
    DiscoveryPayload {
        sandbox_id: record.sandbox_id,
        status: record.status.to_string(),
        region: record.region.clone(),
        worker_id: record.worker_id.as_ref().map(|w| w.to_string()),
        connect_url: format!("https://{}.{domain}", record.sandbox_id),
        token,
        error: record.error.clone(),
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Map the shared taxonomy onto user-visible statuses.
pub(crate) fn fault_response(fault: &Fault) -> (StatusCode, &'static str) {
    match fault.kind() {
        ErrorKind::QuotaExceeded => (StatusCode::TOO_MANY_REQUESTS, "quota"),
        ErrorKind::NoCapacity => (StatusCode::SERVICE_UNAVAILABLE, "no workers"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not found"),
        ErrorKind::Gone => (StatusCode::GONE, "gone"),
        ErrorKind::Busy => (StatusCode::CONFLICT, "busy"),
        ErrorKind::Invalid => (StatusCode::BAD_REQUEST, "invalid"),
        ErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        ErrorKind::UpstreamUnreachable => (StatusCode::BAD_GATEWAY, "upstream unreachable"),
        ErrorKind::CheckpointFailed => (StatusCode::BAD_GATEWAY, "checkpoint failed"),
        ErrorKind::RestoreFailed => (StatusCode::BAD_GATEWAY, "restore failed"),
    }
}

fn fault_into_response(fault: Fault) -> Response {
    let (status, error) = fault_response(&fault);
    (status, Json(ErrorBody { error, message: fault.message })).into_response()
}

fn org_from(headers: &HeaderMap) -> OrgId {
    headers
        .get(ORG_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(OrgId::new)
        .unwrap_or_else(|| OrgId::new("default"))
}

fn region_from(headers: &HeaderMap) -> Option<Region> {
    headers
        .get(REGION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(Region::new)
}

async fn create_sandbox<C: Clock>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Response {
    let mut config = SandboxConfig::new(body.template);
    config.region = body.region.map(Region::new);
    config.idle_seconds = body.idle_seconds;
    config.max_seconds = body.max_seconds;
    config.on_timeout = body.on_timeout.unwrap_or_default();
    config.env = body.env;

    let request = CreateRequest {
        org_id: org_from(&headers),
        config,
        header_region: region_from(&headers),
    };
    match state.placement.create_sandbox(request).await {
        Ok(CreateOutcome { record, connect_url, token }) => {
            let mut payload = discovery(&record, &state.sandbox_domain, Some(token));
            payload.connect_url = connect_url;
            (StatusCode::CREATED, Json(payload)).into_response()
        }
        Err(fault) => fault_into_response(fault),
    }
}

async fn get_sandbox<C: Clock>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> Response {
    let sandbox_id = SandboxId::from_string(&id);
    match state.placement.get_sandbox(&sandbox_id).await {
        Ok(record) => Json(discovery(&record, &state.sandbox_domain, None)).into_response(),
        Err(fault) => fault_into_response(fault),
    }
}

async fn destroy_sandbox<C: Clock>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> Response {
    let sandbox_id = SandboxId::from_string(&id);
    match state.placement.destroy_sandbox(&sandbox_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(fault) => fault_into_response(fault),
    }
}

#[derive(Debug, Serialize)]
struct HibernateBody {
    checkpoint_key: String,
    size_bytes: u64,
}

async fn hibernate_sandbox<C: Clock>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> Response {
    let sandbox_id = SandboxId::from_string(&id);
    match state.placement.hibernate_sandbox(&sandbox_id).await {
        Ok((checkpoint_key, size_bytes)) => {
            Json(HibernateBody { checkpoint_key, size_bytes }).into_response()
        }
        Err(fault) => fault_into_response(fault),
    }
}

async fn wake_sandbox<C: Clock>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> Response {
    let sandbox_id = SandboxId::from_string(&id);
    match state.placement.wake_sandbox(&sandbox_id).await {
        Ok(record) => Json(discovery(&record, &state.sandbox_domain, None)).into_response(),
        Err(fault) => fault_into_response(fault),
    }
}

#[derive(Debug, Serialize)]
struct WorkerRow {
    worker_id: String,
    region: Region,
    capacity: u32,
    current: u32,
    cpu_pct: f32,
    mem_pct: f32,
    missed_sweeps: u32,
}

async fn list_workers<C: Clock>(State(state): State<AppState<C>>) -> Json<Vec<WorkerRow>> {
    let mut rows: Vec<WorkerRow> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|entry| WorkerRow {
            worker_id: entry.beat.worker_id.to_string(),
            region: entry.beat.region,
            capacity: entry.beat.capacity,
            current: entry.beat.current,
            cpu_pct: entry.beat.cpu_pct,
            mem_pct: entry.beat.mem_pct,
            missed_sweeps: entry.missed_sweeps,
        })
        .collect();
    rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Json(rows)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
