// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker service wiring: router, hibernator, heartbeats, RPC, and
//! restart recovery.

use std::sync::Arc;

use sbx_core::{Clock, Fault, Heartbeat, SandboxId, SessionStatus};
use sbx_runtime::RuntimeAdapter;
use sbx_store::{ObjectStore, SessionStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::heartbeat::{HeartbeatPublisher, HeartbeatSink};
use crate::hibernate::{HibernateResult, Hibernator};
use crate::router::{KillReason, Router, RouterEvents, RouterOptions};
use crate::rpc::{RpcCtx, RpcListener};
use crate::tap::TapSlots;

const TAP_SLOT_SPACE: u32 = 65536;

/// Maps router kill events onto authoritative session status.
struct StoreEvents {
    store: Arc<dyn SessionStore>,
}

impl RouterEvents for StoreEvents {
    fn on_hibernate(&self, sandbox_id: &SandboxId, result: &HibernateResult) {
        // The hibernation service already flipped the session; this is
        // bookkeeping only.
        info!(
            sandbox_id = %sandbox_id,
            key = %result.checkpoint_key,
            size = result.size_bytes,
            "hibernate complete"
        );
    }

    fn on_kill(&self, sandbox_id: &SandboxId, reason: KillReason) {
        let (status, error) = match reason {
            KillReason::IdleTimeout => (SessionStatus::Stopped, Some("idle timeout".to_string())),
            KillReason::MaxLifetime => {
                (SessionStatus::Stopped, Some("max lifetime reached".to_string()))
            }
            KillReason::Destroyed => (SessionStatus::Stopped, None),
            KillReason::Shutdown => (SessionStatus::Stopped, Some("worker shutdown".to_string())),
            KillReason::OutOfBand => {
                (SessionStatus::Error, Some("container died out of band".to_string()))
            }
            KillReason::HibernateFailed(reason) => (SessionStatus::Error, Some(reason)),
        };
        let store = Arc::clone(&self.store);
        let sandbox_id = *sandbox_id;
        tokio::spawn(async move {
            if let Err(e) = store.update_status(&sandbox_id, status, error).await {
                warn!(sandbox_id = %sandbox_id, error = %e, "kill status write failed");
            }
        });
    }
}

/// A running worker: owns the router, heartbeat publisher, and RPC
/// listener tasks.
pub struct Worker<C: Clock> {
    config: WorkerConfig,
    router: Router<C>,
    publisher: Arc<HeartbeatPublisher>,
    rpc_task: JoinHandle<()>,
    rpc_local_addr: std::net::SocketAddr,
    cancel: CancellationToken,
}

impl<C: Clock> Worker<C> {
    /// Bind the RPC listener, recover surviving sandboxes, and start
    /// all background tasks.
    pub async fn start(
        config: WorkerConfig,
        store: Arc<dyn SessionStore>,
        objects: Arc<dyn ObjectStore>,
        runtime: Arc<dyn RuntimeAdapter>,
        sink: Arc<dyn HeartbeatSink>,
        clock: C,
        options: RouterOptions,
    ) -> Result<Self, Fault> {
        // TAP indexes live in a /16 of virtual NICs; collisions across
        // sandbox IDs are possible but rare, and the proxy probes
        // availability before choosing a wake target.
        let taps = Arc::new(TapSlots::new(TAP_SLOT_SPACE.max(config.capacity)));
        let events = Arc::new(StoreEvents { store: Arc::clone(&store) });
        let hibernator = Hibernator::new(
            config.clone(),
            Arc::clone(&runtime),
            Arc::clone(&store),
            objects,
            clock.clone(),
        );
        let router = Router::new(
            config.clone(),
            Arc::clone(&runtime),
            Arc::clone(&store),
            hibernator,
            Arc::clone(&taps),
            events,
            clock,
            options,
        );

        recover(&config, &store, &runtime, &router).await;
        router.start();

        let listener = tokio::net::TcpListener::bind(&config.rpc_addr)
            .await
            .map_err(|e| Fault::invalid(format!("bind {}: {e}", config.rpc_addr)))?;
        let rpc_local_addr = listener
            .local_addr()
            .map_err(|e| Fault::invalid(format!("local addr: {e}")))?;
        let cancel = CancellationToken::new();
        let ctx = Arc::new(RpcCtx {
            config: config.clone(),
            router: router.clone(),
            store: Arc::clone(&store),
            runtime,
        });
        let rpc = RpcListener::new(listener, ctx, cancel.clone());
        let rpc_task = tokio::spawn(rpc.run());

        let publisher = Arc::new(HeartbeatPublisher::new(
            sink,
            store,
            snapshot_fn(config.clone(), router.clone()),
        ));
        publisher.start();

        info!(worker_id = %config.worker_id, region = %config.region, "worker started");
        Ok(Self { config, router, publisher, rpc_task, rpc_local_addr, cancel })
    }

    pub fn router(&self) -> &Router<C> {
        &self.router
    }

    /// The actually bound RPC address (resolves `:0` binds).
    pub fn rpc_addr(&self) -> std::net::SocketAddr {
        self.rpc_local_addr
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Stop accepting RPC, then drain the router. `apply_policy`
    /// hibernates or kills survivors per their timeout policy.
    pub async fn shutdown(self, apply_policy: bool) {
        self.publisher.stop();
        self.cancel.cancel();
        self.rpc_task.abort();
        self.router.close(apply_policy).await;
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }
}

/// Rebuild router slots after a restart. Sessions the store says we
/// own either get their slot back (container survived) or are marked
/// failed (container lost while we were down).
async fn recover<C: Clock>(
    config: &WorkerConfig,
    store: &Arc<dyn SessionStore>,
    runtime: &Arc<dyn RuntimeAdapter>,
    router: &Router<C>,
) {
    let sessions = match store.list_sessions_by_worker(&config.worker_id).await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "recovery listing failed");
            return;
        }
    };

    for session in sessions {
        if !matches!(
            session.status,
            SessionStatus::Running | SessionStatus::Creating
        ) {
            continue;
        }
        let sandbox_id = session.sandbox_id;
        if runtime.stats(&sandbox_id).await.is_ok() {
            info!(sandbox_id = %sandbox_id, "recovering: container survived restart");
            router.taps().claim(&sandbox_id);
            router.register_slot(
                sandbox_id,
                session.idle_timeout(),
                session.max_lifetime(),
                session.on_timeout,
            );
        } else {
            warn!(sandbox_id = %sandbox_id, "recovering: container lost while worker was down");
            if let Err(e) = store
                .update_status(
                    &sandbox_id,
                    SessionStatus::Error,
                    Some("container lost at recovery".to_string()),
                )
                .await
            {
                warn!(sandbox_id = %sandbox_id, error = %e, "recovery status write failed");
            }
        }
    }
}

fn snapshot_fn<C: Clock>(
    config: WorkerConfig,
    router: Router<C>,
) -> Arc<dyn Fn() -> Heartbeat + Send + Sync> {
    Arc::new(move || {
        let (cpu_pct, mem_pct) = load_pcts();
        Heartbeat {
            worker_id: config.worker_id.clone(),
            machine_id: config.machine_id,
            region: config.region.clone(),
            rpc_addr: config.rpc_addr.clone(),
            http_addr: config.http_addr.clone(),
            capacity: config.capacity,
            current: router.slot_count() as u32,
            cpu_pct,
            mem_pct,
        }
    })
}

/// Host load from procfs; zeros where unreadable (non-Linux dev hosts).
fn load_pcts() -> (f32, f32) {
    let cpu = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f32>().ok()))
        .map(|load1| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get() as f32)
                .unwrap_or(1.0);
            (load1 / cores * 100.0).min(100.0)
        })
        .unwrap_or(0.0);

    let mem = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| {
            let field = |name: &str| {
                s.lines()
                    .find(|l| l.starts_with(name))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse::<f64>().ok())
            };
            let total = field("MemTotal:")?;
            let available = field("MemAvailable:")?;
            Some(((total - available) / total * 100.0) as f32)
        })
        .unwrap_or(0.0);

    (cpu, mem)
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
