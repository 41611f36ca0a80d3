// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane wiring: heartbeat bus, ingest, registry loop,
//! autoscaler, and the HTTP server with the subdomain proxy in front.

use std::sync::Arc;

use sbx_core::{Clock, Fault, Heartbeat, Region};
use sbx_runtime::MachineProvider;
use sbx_store::SessionStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{api_router, AppState};
use crate::autoscaler::{Autoscaler, AutoscalerOptions};
use crate::ingest::IngestListener;
use crate::placement::{Placement, PlacementConfig};
use crate::pool::WorkerPool;
use crate::registry::{Registry, RegistryOptions};

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// HTTP API + proxy bind address.
    pub http_addr: String,
    /// Heartbeat ingest bind address.
    pub ingest_addr: String,
    pub default_region: Region,
    pub sandbox_domain: String,
    pub org_limit: usize,
    pub token_secret: String,
    pub registry: RegistryOptions,
    pub autoscaler: AutoscalerOptions,
}

/// A running control plane.
pub struct ControlPlane<C: Clock> {
    state: AppState<C>,
    bus_tx: mpsc::Sender<Heartbeat>,
    http_local_addr: std::net::SocketAddr,
    ingest_local_addr: std::net::SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: Clock> ControlPlane<C> {
    pub async fn start(
        config: ControlPlaneConfig,
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn MachineProvider>,
        clock: C,
    ) -> Result<Self, Fault> {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new();
        let registry = Registry::new(pool, clock.clone(), config.registry.clone());

        // Heartbeat bus: ingest listener (and combined-mode workers)
        // produce, the registry loop consumes.
        let (bus_tx, bus_rx) = mpsc::channel::<Heartbeat>(256);

        let ingest_listener = tokio::net::TcpListener::bind(&config.ingest_addr)
            .await
            .map_err(|e| Fault::invalid(format!("bind {}: {e}", config.ingest_addr)))?;
        let ingest_local_addr = ingest_listener
            .local_addr()
            .map_err(|e| Fault::invalid(format!("ingest local addr: {e}")))?;
        let ingest = IngestListener::new(ingest_listener, bus_tx.clone(), cancel.clone());

        let placement = Arc::new(Placement::new(
            registry.clone(),
            Arc::clone(&store),
            clock.clone(),
            PlacementConfig {
                default_region: config.default_region.clone(),
                org_limit: config.org_limit,
                token_secret: config.token_secret.clone(),
                sandbox_domain: config.sandbox_domain.clone(),
            },
        ));
        let autoscaler = Arc::new(Autoscaler::new(
            registry.clone(),
            provider,
            clock.clone(),
            config.autoscaler.clone(),
        ));

        let state = AppState::new(
            placement,
            registry.clone(),
            Arc::clone(&store),
            config.sandbox_domain.clone(),
        );
        let app = api_router(state.clone())
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::proxy::subdomain_middleware::<C>,
            ))
            .layer(tower_http::trace::TraceLayer::new_for_http());

        let http_listener = tokio::net::TcpListener::bind(&config.http_addr)
            .await
            .map_err(|e| Fault::invalid(format!("bind {}: {e}", config.http_addr)))?;
        let http_local_addr = http_listener
            .local_addr()
            .map_err(|e| Fault::invalid(format!("http local addr: {e}")))?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(ingest.run()));
        tasks.push(tokio::spawn(registry.clone().run(
            bus_rx,
            Arc::clone(&store),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(autoscaler.run(cancel.clone())));
        {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let shutdown = async move { cancel.cancelled().await };
                if let Err(e) = axum::serve(http_listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "http server failed");
                }
            }));
        }

        info!(http = %http_local_addr, ingest = %ingest_local_addr, "control plane started");
        Ok(Self { state, bus_tx, http_local_addr, ingest_local_addr, cancel, tasks })
    }

    /// Direct handle onto the heartbeat bus (combined mode wires the
    /// local worker's sink here).
    pub fn heartbeat_tx(&self) -> mpsc::Sender<Heartbeat> {
        self.bus_tx.clone()
    }

    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_local_addr
    }

    pub fn ingest_addr(&self) -> std::net::SocketAddr {
        self.ingest_local_addr
    }

    pub fn registry(&self) -> &Registry<C> {
        &self.state.registry
    }

    pub fn placement(&self) -> &Arc<Placement<C>> {
        &self.state.placement
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
        info!("control plane stopped");
    }
}
