// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subdomain reverse proxy.
//!
//! Requests whose `Host` is `<sandbox_id>.<base_domain>` are routed to
//! the owning worker's data plane, transparently waking hibernated
//! sandboxes and recovering sessions whose worker vanished. Everything
//! else falls through to the API router.
//!
//! Plain HTTP is forwarded through a reqwest client; WebSocket (any
//! `Upgrade` request) hijacks the client connection, replays the
//! original request head to the worker over raw TCP, and pipes bytes
//! both ways with half-close on EOF.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use sbx_core::{Clock, ErrorKind, Fault, Heartbeat, SandboxId, SessionRecord, SessionStatus};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::api::AppState;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// Cap on an upstream response head during WebSocket bridging.
const MAX_HEAD: usize = 16 * 1024;

/// Extract the sandbox ID from `<sandbox_id>.<base_domain>[:port]`.
pub fn parse_sandbox_host(host: &str, base_domain: &str) -> Option<SandboxId> {
    let host = host.split(':').next().unwrap_or(host);
    let label = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(SandboxId::from_string(label))
}

/// Outer middleware: subdomain hosts short-circuit into the proxy.
pub async fn subdomain_middleware<C: Clock>(
    State(state): State<AppState<C>>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match parse_sandbox_host(host, &state.sandbox_domain) {
        Some(sandbox_id) => handle_proxy(state, sandbox_id, request).await,
        None => next.run(request).await,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// Proxy-side degradation of faults: terminal is 410, everything else
/// surfaces as a bad gateway.
fn degrade(fault: Fault) -> Response {
    let status = match fault.kind() {
        ErrorKind::Gone => StatusCode::GONE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_response(status, &fault.to_string())
}

async fn handle_proxy<C: Clock>(
    state: AppState<C>,
    sandbox_id: SandboxId,
    request: Request,
) -> Response {
    let session = match state.store.get_session(&sandbox_id).await {
        Ok(session) => session,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "unknown sandbox"),
    };

    match session.status {
        SessionStatus::Hibernated => wake_and_proxy(state, session, request).await,
        SessionStatus::Stopped | SessionStatus::Error => {
            error_response(StatusCode::GONE, "sandbox is gone")
        }
        SessionStatus::Creating => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "sandbox is starting")
        }
        SessionStatus::Running => {
            let worker = session
                .worker_id
                .as_ref()
                .and_then(|worker_id| state.registry.get(worker_id));
            match worker {
                Some(beat) => proxy_to(state, beat, sandbox_id, request).await,
                None => recover_or_fail(state, session, request).await,
            }
        }
    }
}

/// Wake the sandbox, then forward the original request to its new
/// worker. A hibernated session without an active checkpoint is a
/// corruption case: 502, and the status is left untouched.
async fn wake_and_proxy<C: Clock>(
    state: AppState<C>,
    session: SessionRecord,
    request: Request,
) -> Response {
    let sandbox_id = session.sandbox_id;
    if state.store.get_active_checkpoint(&sandbox_id).await.is_err() {
        warn!(sandbox_id = %sandbox_id, "hibernated session has no active checkpoint");
        return error_response(StatusCode::BAD_GATEWAY, "no active checkpoint");
    }

    let record = match state.placement.wake_sandbox(&sandbox_id).await {
        Ok(record) => record,
        Err(fault) => {
            warn!(sandbox_id = %sandbox_id, error = %fault, "wake-on-request failed");
            return degrade(fault);
        }
    };

    let worker = record
        .worker_id
        .as_ref()
        .and_then(|worker_id| state.registry.get(worker_id));
    match worker {
        Some(beat) => {
            info!(sandbox_id = %sandbox_id, worker_id = %beat.worker_id, "woken by request");
            proxy_to(state, beat, sandbox_id, request).await
        }
        None => error_response(StatusCode::BAD_GATEWAY, "woken worker not registered"),
    }
}

/// The session says running but the owner is gone (restart or
/// scale-down race). A checkpoint lets us wake elsewhere; otherwise
/// the sandbox is declared lost.
async fn recover_or_fail<C: Clock>(
    state: AppState<C>,
    session: SessionRecord,
    request: Request,
) -> Response {
    let sandbox_id = session.sandbox_id;
    if state.store.get_active_checkpoint(&sandbox_id).await.is_ok() {
        info!(sandbox_id = %sandbox_id, "owner lost; recovering from checkpoint");
        // Recovery wakes from the checkpointed state; flip the session
        // so wake placement accepts it.
        if let Err(e) = state
            .store
            .update_status(&sandbox_id, SessionStatus::Hibernated, None)
            .await
        {
            warn!(sandbox_id = %sandbox_id, error = %e, "recovery status flip failed");
            return error_response(StatusCode::BAD_GATEWAY, "recovery failed");
        }
        let mut session = session;
        session.status = SessionStatus::Hibernated;
        return wake_and_proxy(state, session, request).await;
    }

    warn!(sandbox_id = %sandbox_id, "owner lost with no checkpoint; stopping");
    if let Err(e) = state
        .store
        .update_status(
            &sandbox_id,
            SessionStatus::Stopped,
            Some("worker lost".to_string()),
        )
        .await
    {
        warn!(sandbox_id = %sandbox_id, error = %e, "lost-worker status write failed");
    }
    error_response(StatusCode::GONE, "sandbox lost with its worker")
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && headers.contains_key(header::UPGRADE)
}

async fn proxy_to<C: Clock>(
    state: AppState<C>,
    beat: Heartbeat,
    sandbox_id: SandboxId,
    request: Request,
) -> Response {
    if is_upgrade(request.headers()) {
        proxy_upgrade(beat, request).await
    } else {
        proxy_http(state, beat, sandbox_id, request).await
    }
}

const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

async fn proxy_http<C: Clock>(
    state: AppState<C>,
    beat: Heartbeat,
    sandbox_id: SandboxId,
    request: Request,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://{}{}", beat.http_addr, path_and_query);

    let method = match reqwest::Method::from_bytes(request.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "bad method"),
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        // Original Host is preserved so the worker's per-sandbox HTTP
        // routing still sees the subdomain.
        headers.append(name.clone(), value.clone());
    }

    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());
    let send = state
        .http_client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send();

    let upstream = match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, send).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            debug!(url = %url, error = %e, "proxy upstream error");
            return error_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
        }
        Err(_) => return error_response(StatusCode::GATEWAY_TIMEOUT, "upstream header timeout"),
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    // A worker that no longer knows the sandbox answers 502 with a
    // recognizable body; the sandbox is lost on that worker.
    if status == StatusCode::BAD_GATEWAY {
        let body = upstream.text().await.unwrap_or_default();
        let lost = body.contains("not found") || body.contains("not available");
        if lost {
            warn!(sandbox_id = %sandbox_id, "worker reports sandbox lost");
            let _ = state
                .store
                .update_status(
                    &sandbox_id,
                    SessionStatus::Stopped,
                    Some("lost on worker".to_string()),
                )
                .await;
            return error_response(StatusCode::GONE, "sandbox lost on worker");
        }
        return (StatusCode::BAD_GATEWAY, body).into_response();
    }

    let mut response = Response::builder().status(status);
    if let Some(headers_mut) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(name) {
                continue;
            }
            headers_mut.append(name.clone(), value.clone());
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "response build failed"))
}

/// Serialize the original request head for replay to the worker.
fn request_head(request: &Request) -> Vec<u8> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method(), path_and_query).into_bytes();
    for (name, value) in request.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

struct ParsedHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
}

/// Read an HTTP/1.1 response head; returns the head and any body
/// bytes that arrived with it.
async fn read_response_head(
    stream: &mut TcpStream,
) -> Result<(ParsedHead, Vec<u8>), std::io::Error> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed during response head",
            ));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad upstream status line")
        })?;
    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    Ok((ParsedHead { status, headers }, Vec::new()))
}

/// WebSocket (or any upgrade) passthrough: replay the request head to
/// the worker, relay its 101 back, then pipe raw bytes until both
/// directions close.
async fn proxy_upgrade(beat: Heartbeat, mut request: Request) -> Response {
    let upgrade = hyper::upgrade::on(&mut request);

    let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&beat.http_addr)).await;
    let mut upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(addr = %beat.http_addr, error = %e, "upgrade dial failed");
            return error_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
        }
        Err(_) => return error_response(StatusCode::GATEWAY_TIMEOUT, "upstream dial timeout"),
    };
    if let Err(e) = upstream.write_all(&request_head(&request)).await {
        debug!(error = %e, "upgrade head write failed");
        return error_response(StatusCode::BAD_GATEWAY, "upstream write failed");
    }

    let (head, leftover) = match read_response_head(&mut upstream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "upgrade head read failed");
            return error_response(StatusCode::BAD_GATEWAY, "bad upstream handshake");
        }
    };

    let mut response = Response::builder().status(head.status);
    if let Some(headers_mut) = response.headers_mut() {
        for (name, value) in &head.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers_mut.append(name, value);
            }
        }
    }

    if head.status == StatusCode::SWITCHING_PROTOCOLS {
        tokio::spawn(async move {
            match upgrade.await {
                Ok(client) => pipe(TokioIo::new(client), upstream, leftover).await,
                Err(e) => warn!(error = %e, "client upgrade failed"),
            }
        });
    }

    response
        .body(Body::empty())
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "response build failed"))
}

/// Bidirectional byte pipe with half-close on EOF in each direction.
async fn pipe<A, B>(client: A, upstream: B, upstream_leftover: Vec<u8>)
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    if !upstream_leftover.is_empty() && client_w.write_all(&upstream_leftover).await.is_err() {
        return;
    }

    let client_to_upstream = async {
        let _ = tokio::io::copy(&mut client_r, &mut upstream_w).await;
        let _ = upstream_w.shutdown().await;
    };
    let upstream_to_client = async {
        let _ = tokio::io::copy(&mut upstream_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
    };
    tokio::join!(client_to_upstream, upstream_to_client);
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
