// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Utilization-driven autoscaler.
//!
//! One evaluation loop per fixed interval. Scale-up is gated by the
//! per-region cooldown and the single-pending-launch rule, so a
//! traffic spike yields at most one new machine per region per
//! cooldown. Scale-down drains explicitly and is not cooldown-gated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sbx_core::{Clock, MachineId, Region};
use sbx_runtime::{MachineOpts, MachineProvider};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct AutoscalerOptions {
    pub interval: Duration,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown: Duration,
    pub region_cap: usize,
    pub region_min: usize,
    /// Pending launches older than this are destroyed and forgotten.
    pub pending_ttl: Duration,
    pub machine_size: String,
    pub machine_image: String,
    pub secrets_ref: Option<String>,
}

impl Default for AutoscalerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            scale_up_threshold: 0.70,
            scale_down_threshold: 0.30,
            cooldown: Duration::from_secs(300),
            region_cap: 10,
            region_min: 1,
            pending_ttl: Duration::from_secs(600),
            machine_size: "standard-4".to_string(),
            machine_image: "sbx-worker:latest".to_string(),
            secrets_ref: None,
        }
    }
}

struct PendingLaunch {
    machine_id: MachineId,
    launched_at: Instant,
}

pub struct Autoscaler<C: Clock> {
    registry: Registry<C>,
    provider: Arc<dyn MachineProvider>,
    options: AutoscalerOptions,
    clock: C,
    pending: Mutex<HashMap<Region, Vec<PendingLaunch>>>,
    last_scale_up: Mutex<HashMap<Region, Instant>>,
}

impl<C: Clock> Autoscaler<C> {
    pub fn new(
        registry: Registry<C>,
        provider: Arc<dyn MachineProvider>,
        clock: C,
        options: AutoscalerOptions,
    ) -> Self {
        Self {
            registry,
            provider,
            options,
            clock,
            pending: Mutex::new(HashMap::new()),
            last_scale_up: Mutex::new(HashMap::new()),
        }
    }

    /// Pending launches currently tracked for a region.
    pub fn pending_count(&self, region: &Region) -> usize {
        self.pending.lock().get(region).map(Vec::len).unwrap_or(0)
    }

    /// One full evaluation pass over every known region.
    pub async fn evaluate(&self) {
        let mut regions = self.registry.regions();
        for region in self.provider.supported_regions() {
            if !regions.contains(&region) {
                regions.push(region);
            }
        }
        for region in regions {
            self.reap_pending(&region).await;
            self.evaluate_region(&region).await;
        }
    }

    /// Drop pending launches that registered; destroy those that
    /// exceeded the TTL without ever heartbeating.
    async fn reap_pending(&self, region: &Region) {
        let now = self.clock.now();
        let (registered, timed_out): (Vec<MachineId>, Vec<MachineId>) = {
            let mut pending = self.pending.lock();
            let Some(launches) = pending.get_mut(region) else { return };
            let mut registered = Vec::new();
            let mut timed_out = Vec::new();
            launches.retain(|launch| {
                if self.registry.has_machine(&launch.machine_id) {
                    registered.push(launch.machine_id);
                    false
                } else if now.duration_since(launch.launched_at) >= self.options.pending_ttl {
                    timed_out.push(launch.machine_id);
                    false
                } else {
                    true
                }
            });
            (registered, timed_out)
        };

        for machine_id in registered {
            info!(region = %region, machine_id = %machine_id, "pending launch registered");
        }
        for machine_id in timed_out {
            warn!(region = %region, machine_id = %machine_id, "pending launch timed out, destroying");
            if let Err(e) = self.provider.destroy(&machine_id).await {
                warn!(machine_id = %machine_id, error = %e, "destroy of timed-out launch failed");
            }
        }
    }

    async fn evaluate_region(&self, region: &Region) {
        let workers = self.registry.workers_in_region(region);
        let utilization = self.registry.region_utilization(region);
        let pending = self.pending_count(region);

        if utilization > self.options.scale_up_threshold {
            self.maybe_scale_up(region, workers.len(), pending, utilization)
                .await;
        } else if utilization < self.options.scale_down_threshold
            && workers.len() > self.options.region_min
        {
            self.scale_down(region, &workers).await;
        }
    }

    async fn maybe_scale_up(
        &self,
        region: &Region,
        live: usize,
        pending: usize,
        utilization: f64,
    ) {
        if pending > 0 {
            return;
        }
        if live + pending >= self.options.region_cap {
            return;
        }
        let now = self.clock.now();
        if let Some(last) = self.last_scale_up.lock().get(region) {
            if now.duration_since(*last) < self.options.cooldown {
                return;
            }
        }

        let opts = MachineOpts {
            region: region.clone(),
            size: self.options.machine_size.clone(),
            image: self.options.machine_image.clone(),
            secrets_ref: self.options.secrets_ref.clone(),
        };
        match self.provider.create(&opts).await {
            Ok(machine) => {
                info!(
                    region = %region,
                    machine_id = %machine.machine_id,
                    utilization,
                    "scaling up"
                );
                self.pending
                    .lock()
                    .entry(region.clone())
                    .or_default()
                    .push(PendingLaunch { machine_id: machine.machine_id, launched_at: now });
                self.last_scale_up.lock().insert(region.clone(), now);
            }
            Err(e) => warn!(region = %region, error = %e, "scale-up create failed"),
        }
    }

    /// Drain then destroy the least-loaded worker. The registry drops
    /// the entry on its next reconcile once heartbeats stop.
    async fn scale_down(&self, region: &Region, workers: &[sbx_core::Heartbeat]) {
        let Some(target) = workers.iter().min_by_key(|b| b.current) else {
            return;
        };
        info!(
            region = %region,
            worker_id = %target.worker_id,
            machine_id = %target.machine_id,
            current = target.current,
            "scaling down"
        );
        if let Err(e) = self.provider.drain(&target.machine_id).await {
            warn!(machine_id = %target.machine_id, error = %e, "drain failed");
            return;
        }
        if let Err(e) = self.provider.destroy(&target.machine_id).await {
            warn!(machine_id = %target.machine_id, error = %e, "destroy failed");
            return;
        }
        self.registry.remove(&target.worker_id);
    }

    /// Evaluation loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.evaluate().await,
            }
        }
    }
}

#[cfg(test)]
#[path = "autoscaler_tests.rs"]
mod tests;
