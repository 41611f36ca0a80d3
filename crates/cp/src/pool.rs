// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection pool to workers.
//!
//! One persistent RPC connection per worker, dialed eagerly when the
//! registry learns an address so liveness is observable without
//! waiting for a real call. A failed call poisons the connection; the
//! next call redials. The keepalive pinger marks a path dead after
//! three consecutive failures (with a 10 s ping interval a dead TCP
//! path surfaces within about 40 s).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sbx_core::{Fault, WorkerId};
use sbx_wire::{Client, Request, Response};
use tracing::{debug, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(3);
const DEAD_AFTER_FAILURES: u32 = 3;

struct PoolEntry {
    addr: String,
    client: tokio::sync::Mutex<Option<Client>>,
    consecutive_failures: AtomicU32,
}

/// Shared worker connection pool.
#[derive(Clone, Default)]
pub struct WorkerPool {
    entries: Arc<RwLock<HashMap<WorkerId, Arc<PoolEntry>>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a worker address. When the address
    /// changed or the connection is failed, the old connection is
    /// dropped and a fresh dial starts in the background.
    pub fn upsert(&self, worker_id: &WorkerId, addr: &str) {
        let needs_dial = {
            let mut entries = self.entries.write();
            match entries.get(worker_id) {
                Some(entry)
                    if entry.addr == addr
                        && entry.consecutive_failures.load(Ordering::Acquire)
                            < DEAD_AFTER_FAILURES =>
                {
                    false
                }
                _ => {
                    entries.insert(
                        worker_id.clone(),
                        Arc::new(PoolEntry {
                            addr: addr.to_string(),
                            client: tokio::sync::Mutex::new(None),
                            consecutive_failures: AtomicU32::new(0),
                        }),
                    );
                    true
                }
            }
        };
        if needs_dial {
            // Eager connect so a dead path is noticed before first use.
            let pool = self.clone();
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.ensure_connected(&worker_id).await {
                    debug!(worker_id = %worker_id, error = %e, "eager dial failed");
                }
            });
        }
    }

    pub fn remove(&self, worker_id: &WorkerId) {
        self.entries.write().remove(worker_id);
    }

    /// Whether the keepalive has declared this path dead.
    pub fn is_failed(&self, worker_id: &WorkerId) -> bool {
        self.entries
            .read()
            .get(worker_id)
            .map(|e| e.consecutive_failures.load(Ordering::Acquire) >= DEAD_AFTER_FAILURES)
            .unwrap_or(true)
    }

    fn entry(&self, worker_id: &WorkerId) -> Result<Arc<PoolEntry>, Fault> {
        self.entries
            .read()
            .get(worker_id)
            .cloned()
            .ok_or_else(|| Fault::upstream(format!("no connection for worker {worker_id}")))
    }

    async fn ensure_connected(&self, worker_id: &WorkerId) -> Result<(), Fault> {
        let entry = self.entry(worker_id)?;
        let mut slot = entry.client.lock().await;
        if slot.is_none() {
            let client = Client::connect(&entry.addr, DIAL_TIMEOUT)
                .await
                .map_err(|e| Fault::upstream(format!("dial {}: {e}", entry.addr)))?;
            *slot = Some(client);
        }
        Ok(())
    }

    /// One RPC to a worker with a call deadline. Requests to the same
    /// worker serialize on its connection.
    pub async fn call(
        &self,
        worker_id: &WorkerId,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, Fault> {
        let entry = self.entry(worker_id)?;
        let mut slot = entry.client.lock().await;
        if slot.is_none() {
            match Client::connect(&entry.addr, DIAL_TIMEOUT).await {
                Ok(client) => *slot = Some(client),
                Err(e) => {
                    entry.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                    return Err(Fault::upstream(format!("dial {}: {e}", entry.addr)));
                }
            }
        }
        let client = match slot.as_mut() {
            Some(client) => client,
            None => return Err(Fault::upstream("connection unavailable")),
        };
        match client.request(request, timeout).await {
            Ok(response) => {
                entry.consecutive_failures.store(0, Ordering::Release);
                Ok(response)
            }
            Err(e) => {
                // Poison the connection; the next call redials.
                *slot = None;
                entry.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                Err(Fault::upstream(format!("worker {worker_id} rpc: {e}")))
            }
        }
    }

    /// Ping every pooled worker once. Run by the registry's keepalive
    /// ticker.
    pub async fn ping_all(&self) {
        let ids: Vec<WorkerId> = self.entries.read().keys().cloned().collect();
        for worker_id in ids {
            match self.call(&worker_id, &Request::Ping, PING_TIMEOUT).await {
                Ok(Response::Pong) => {}
                Ok(other) => {
                    warn!(worker_id = %worker_id, response = ?other, "unexpected ping reply")
                }
                Err(e) => debug!(worker_id = %worker_id, error = %e, "ping failed"),
            }
        }
    }
}
