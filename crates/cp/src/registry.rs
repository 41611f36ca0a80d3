// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker registry: the control plane's in-memory view of live
//! workers, fed by heartbeats and reconciled against durable worker
//! keys. Never errors toward the data path — lookups return empty and
//! higher layers decide policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sbx_core::{Clock, Heartbeat, Region, WorkerId};
use sbx_store::SessionStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Reconcile sweep interval.
    pub sweep_interval: Duration,
    /// Entries unseen for this many sweeps are purged.
    pub evict_after_sweeps: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            evict_after_sweeps: 2,
        }
    }
}

/// One live worker as the registry sees it.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub beat: Heartbeat,
    pub last_seen_ms: u64,
    pub missed_sweeps: u32,
}

struct RegistryInner<C: Clock> {
    entries: RwLock<HashMap<WorkerId, RegistryEntry>>,
    pool: WorkerPool,
    clock: C,
    options: RegistryOptions,
}

#[derive(Clone)]
pub struct Registry<C: Clock>(Arc<RegistryInner<C>>);

impl<C: Clock> Registry<C> {
    pub fn new(pool: WorkerPool, clock: C, options: RegistryOptions) -> Self {
        Self(Arc::new(RegistryInner {
            entries: RwLock::new(HashMap::new()),
            pool,
            clock,
            options,
        }))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.0.pool
    }

    /// Ingest one heartbeat: upsert the entry and keep the pool's
    /// connection fresh.
    pub fn upsert(&self, beat: Heartbeat) {
        let worker_id = beat.worker_id.clone();
        self.0.pool.upsert(&worker_id, &beat.rpc_addr);
        let mut entries = self.0.entries.write();
        let now_ms = self.0.clock.epoch_ms();
        let is_new = entries
            .insert(
                worker_id.clone(),
                RegistryEntry { beat, last_seen_ms: now_ms, missed_sweeps: 0 },
            )
            .is_none();
        if is_new {
            info!(worker_id = %worker_id, "worker registered");
        }
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<Heartbeat> {
        self.0.entries.read().get(worker_id).map(|e| e.beat.clone())
    }

    /// Drop a worker (scale-down or eviction) and close its connection.
    pub fn remove(&self, worker_id: &WorkerId) {
        self.0.entries.write().remove(worker_id);
        self.0.pool.remove(worker_id);
        info!(worker_id = %worker_id, "worker removed from registry");
    }

    /// Healthy workers in a region, most free capacity first.
    pub fn workers_in_region(&self, region: &Region) -> Vec<Heartbeat> {
        let mut workers: Vec<Heartbeat> = self
            .0
            .entries
            .read()
            .values()
            .filter(|e| &e.beat.region == region)
            .map(|e| e.beat.clone())
            .collect();
        workers.sort_by_key(|b| std::cmp::Reverse(b.free_capacity()));
        workers
    }

    /// Placement choice: the admitting worker with the most headroom in
    /// the region, falling back across regions when none qualifies.
    pub fn pick(&self, region: &Region, need: u32) -> Option<Heartbeat> {
        let entries = self.0.entries.read();
        let best_in = |filter: &dyn Fn(&Heartbeat) -> bool| {
            entries
                .values()
                .map(|e| &e.beat)
                .filter(|b| b.admits(need) && filter(b))
                .max_by_key(|b| b.free_capacity())
                .cloned()
        };
        best_in(&|b| &b.region == region).or_else(|| best_in(&|_| true))
    }

    /// Count-based utilization across the region's workers.
    pub fn region_utilization(&self, region: &Region) -> f64 {
        let entries = self.0.entries.read();
        let (current, capacity) = entries
            .values()
            .filter(|e| &e.beat.region == region)
            .fold((0u64, 0u64), |(cur, cap), e| {
                (cur + e.beat.current as u64, cap + e.beat.capacity as u64)
            });
        if capacity == 0 {
            0.0
        } else {
            current as f64 / capacity as f64
        }
    }

    /// Regions with at least one registered worker.
    pub fn regions(&self) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .0
            .entries
            .read()
            .values()
            .map(|e| e.beat.region.clone())
            .collect();
        regions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        regions.dedup();
        regions
    }

    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.0.entries.read().values().cloned().collect()
    }

    /// Whether any registered machine matches (pending-launch reaping).
    pub fn has_machine(&self, machine_id: &sbx_core::MachineId) -> bool {
        self.0
            .entries
            .read()
            .values()
            .any(|e| &e.beat.machine_id == machine_id)
    }

    /// One reconcile pass: re-observe workers from durable keys, then
    /// purge entries silent for the configured number of sweeps.
    pub fn sweep(&self, durable_keys: Vec<Heartbeat>) {
        for beat in durable_keys {
            // A live TTL key counts as an observation even when the
            // pub/sub delivery was lost.
            self.upsert(beat);
        }

        let now_ms = self.0.clock.epoch_ms();
        let sweep_ms = self.0.options.sweep_interval.as_millis() as u64;
        let mut evicted = Vec::new();
        {
            let mut entries = self.0.entries.write();
            for (worker_id, entry) in entries.iter_mut() {
                if now_ms.saturating_sub(entry.last_seen_ms) >= sweep_ms {
                    entry.missed_sweeps += 1;
                } else {
                    entry.missed_sweeps = 0;
                }
                if entry.missed_sweeps >= self.0.options.evict_after_sweeps {
                    evicted.push(worker_id.clone());
                }
            }
            for worker_id in &evicted {
                entries.remove(worker_id);
            }
        }
        for worker_id in evicted {
            warn!(worker_id = %worker_id, "worker evicted (missed heartbeats)");
            self.0.pool.remove(&worker_id);
        }
    }

    /// Long-running ingest + reconcile task. Consumes the heartbeat
    /// bus, sweeps on the configured interval, and pings connections.
    pub async fn run(
        self,
        mut bus: mpsc::Receiver<Heartbeat>,
        store: Arc<dyn SessionStore>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.0.options.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping = tokio::time::interval(crate::pool::PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                beat = bus.recv() => match beat {
                    Some(beat) => self.upsert(beat),
                    None => break,
                },
                _ = sweep.tick() => {
                    let keys = match store.list_worker_keys().await {
                        Ok(keys) => keys,
                        Err(e) => {
                            debug!(error = %e, "worker key scan failed");
                            Vec::new()
                        }
                    };
                    self.sweep(keys);
                }
                _ = ping.tick() => self.0.pool.ping_all().await,
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
