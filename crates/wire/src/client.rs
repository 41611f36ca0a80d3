// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent RPC client over one TCP connection.
//!
//! The registry's connection pool holds one of these per worker and
//! serializes requests on it; a failed call poisons the connection and
//! the pool redials.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::framing::{self, ProtocolError};
use crate::{Request, Response};

/// One framed-JSON RPC connection.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Dial `addr` with a connect timeout.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ProtocolError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one request and wait for its response within `timeout`.
    ///
    /// Requests on one connection are strictly sequential; the caller
    /// (pool) guarantees exclusive access for the duration of a call.
    pub async fn request(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let payload = framing::encode(request)?;
        framing::write_message(&mut self.stream, &payload).await?;
        let frame = tokio::time::timeout(timeout, framing::read_message(&mut self.stream))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        framing::decode(&frame)
    }

    /// Fire a request without waiting for a reply (heartbeat push).
    pub async fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let payload = framing::encode(request)?;
        framing::write_message(&mut self.stream, &payload).await
    }
}

/// One-shot request over a fresh connection.
pub async fn oneshot(
    addr: &str,
    request: &Request,
    timeout: Duration,
) -> Result<Response, ProtocolError> {
    let mut client = Client::connect(addr, timeout).await?;
    client.request(request, timeout).await
}
