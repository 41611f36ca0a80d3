// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heartbeat ingest listener.
//!
//! Workers push `Heartbeat` frames over persistent TCP connections;
//! each one lands on the in-process heartbeat bus the registry
//! consumes. Heartbeats are fire-and-forget (no response frame), so a
//! worker's publisher never blocks on the control plane.

use sbx_core::{Fault, Heartbeat};
use sbx_wire::{read_request, write_response, ProtocolError, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONNECTION_IDLE: Duration = Duration::from_secs(60);

/// Accept loop feeding the heartbeat bus.
pub struct IngestListener {
    listener: TcpListener,
    bus: mpsc::Sender<Heartbeat>,
    cancel: CancellationToken,
}

impl IngestListener {
    pub fn new(
        listener: TcpListener,
        bus: mpsc::Sender<Heartbeat>,
        cancel: CancellationToken,
    ) -> Self {
        Self { listener, bus, cancel }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "heartbeat ingest listening");
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!(%addr, "ingest connection");
                        let bus = self.bus.clone();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_connection(reader, writer, bus).await;
                        });
                    }
                    Err(e) => error!("ingest accept error: {}", e),
                },
            }
        }
    }
}

async fn handle_connection<R, W>(mut reader: R, mut writer: W, bus: mpsc::Sender<Heartbeat>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_request(&mut reader, CONNECTION_IDLE).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) | Err(ProtocolError::Timeout) => break,
            Err(e) => {
                warn!(error = %e, "ingest read error");
                break;
            }
        };
        match request {
            Request::Heartbeat { beat } => {
                // Fire-and-forget: no response frame for heartbeats.
                if bus.send(beat).await.is_err() {
                    break;
                }
            }
            Request::Ping => {
                if write_response(&mut writer, &Response::Pong).await.is_err() {
                    break;
                }
            }
            other => {
                debug!(request = ?other, "non-heartbeat request on ingest");
                let response = Response::Error {
                    fault: Fault::invalid("ingest accepts heartbeats only"),
                };
                if write_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
        }
    }
}
