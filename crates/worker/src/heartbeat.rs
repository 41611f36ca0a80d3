// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heartbeat publisher.
//!
//! Every interval the worker snapshots itself and pushes the beat to
//! the registry transport (TCP to the control plane, or an in-process
//! channel in combined mode) and writes the durable worker key with a
//! TTL. A missed publish is logged and skipped; the registry's 3-miss
//! rule handles sustained silence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sbx_core::{Fault, Heartbeat};
use sbx_store::SessionStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Publish interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// TTL on the durable worker key.
pub const WORKER_KEY_TTL: Duration = Duration::from_secs(30);

/// Where beats go.
#[async_trait]
pub trait HeartbeatSink: Send + Sync + 'static {
    async fn publish(&self, beat: Heartbeat) -> Result<(), Fault>;
}

/// In-process sink for combined mode and tests.
pub struct LocalSink {
    tx: mpsc::Sender<Heartbeat>,
}

impl LocalSink {
    pub fn new(tx: mpsc::Sender<Heartbeat>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl HeartbeatSink for LocalSink {
    async fn publish(&self, beat: Heartbeat) -> Result<(), Fault> {
        self.tx
            .send(beat)
            .await
            .map_err(|_| Fault::upstream("heartbeat bus closed"))
    }
}

/// TCP sink pushing to the control plane's ingest listener. Keeps one
/// connection and redials after a failure.
pub struct WireSink {
    cp_addr: String,
    client: tokio::sync::Mutex<Option<sbx_wire::Client>>,
}

impl WireSink {
    pub fn new(cp_addr: impl Into<String>) -> Self {
        Self { cp_addr: cp_addr.into(), client: tokio::sync::Mutex::new(None) }
    }
}

#[async_trait]
impl HeartbeatSink for WireSink {
    async fn publish(&self, beat: Heartbeat) -> Result<(), Fault> {
        let mut slot = self.client.lock().await;
        if slot.is_none() {
            let client = sbx_wire::Client::connect(&self.cp_addr, Duration::from_secs(2))
                .await
                .map_err(|e| Fault::upstream(format!("heartbeat dial {}: {e}", self.cp_addr)))?;
            *slot = Some(client);
        }
        let client = match slot.as_mut() {
            Some(c) => c,
            None => return Err(Fault::upstream("heartbeat connection unavailable")),
        };
        if let Err(e) = client.send(&sbx_wire::Request::Heartbeat { beat }).await {
            *slot = None;
            return Err(Fault::upstream(format!("heartbeat push: {e}")));
        }
        Ok(())
    }
}

/// Periodic publisher task.
pub struct HeartbeatPublisher {
    sink: Arc<dyn HeartbeatSink>,
    store: Arc<dyn SessionStore>,
    snapshot: Arc<dyn Fn() -> Heartbeat + Send + Sync>,
    interval: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatPublisher {
    pub fn new(
        sink: Arc<dyn HeartbeatSink>,
        store: Arc<dyn SessionStore>,
        snapshot: Arc<dyn Fn() -> Heartbeat + Send + Sync>,
    ) -> Self {
        Self {
            sink,
            store,
            snapshot,
            interval: HEARTBEAT_INTERVAL,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Publish one beat to both channels. Failures never propagate.
    pub async fn publish_once(&self) {
        let beat = (self.snapshot)();
        debug!(worker_id = %beat.worker_id, current = beat.current, "heartbeat");
        if let Err(e) = self.sink.publish(beat.clone()).await {
            warn!(error = %e, "heartbeat publish failed");
        }
        if let Err(e) = self.store.put_worker_key(beat, WORKER_KEY_TTL).await {
            warn!(error = %e, "worker key write failed");
        }
    }

    pub fn start(self: &Arc<Self>) {
        let publisher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(publisher.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = publisher.cancel.cancelled() => break,
                    _ = ticker.tick() => publisher.publish_once().await,
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
