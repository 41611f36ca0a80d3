// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! sbxd: sandbox platform daemon.
//!
//! Runs the control plane (`server`), a worker (`worker`), or both in
//! one process (`combined`), selected by `SBX_MODE`.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod env;
mod lifecycle;

use std::process::ExitCode;
use std::sync::Arc;

use sbx_core::{Region, SystemClock};
use sbx_cp::{AutoscalerOptions, ControlPlane, ControlPlaneConfig, RegistryOptions};
use sbx_runtime::{DockerRuntime, K8sProvider, MachineProvider, NullProvider};
use sbx_store::{FileStore, FsObjectStore, ObjectStore, SessionStore};
use sbx_worker::{LocalSink, RouterOptions, WireSink, Worker, WorkerConfig};
use tracing::{error, info};

use crate::env::{Mode, Settings};
use crate::lifecycle::LifecycleError;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("sbxd: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("sbxd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), LifecycleError> {
    let settings = Settings::load()?;
    let mode = settings.mode()?;
    let data_dir = settings.data_dir()?;

    let _lock = lifecycle::lock_data_dir(&data_dir)?;
    let _log_guard = lifecycle::init_logging(&data_dir)?;
    info!(?mode, data_dir = %data_dir.display(), version = env!("CARGO_PKG_VERSION"), "sbxd starting");

    let store: Arc<dyn SessionStore> = Arc::new(
        FileStore::open(&data_dir).map_err(|e| LifecycleError::BadConfig(e.to_string()))?,
    );
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(data_dir.join("blobs")));

    match mode {
        Mode::Server => {
            let cp = start_control_plane(&settings, Arc::clone(&store)).await?;
            lifecycle::shutdown_signal().await;
            cp.shutdown().await;
        }
        Mode::Worker => {
            let sink = Arc::new(WireSink::new(settings.cp_addr()));
            let worker = start_worker(&settings, &data_dir, store, objects, sink).await?;
            lifecycle::shutdown_signal().await;
            // Survivors follow their timeout policy so hibernatable
            // sandboxes are preserved across worker restarts.
            worker.shutdown(true).await;
        }
        Mode::Combined => {
            let cp = start_control_plane(&settings, Arc::clone(&store)).await?;
            let sink = Arc::new(LocalSink::new(cp.heartbeat_tx()));
            let worker = start_worker(&settings, &data_dir, store, objects, sink).await?;
            lifecycle::shutdown_signal().await;
            worker.shutdown(true).await;
            cp.shutdown().await;
        }
    }

    info!("sbxd stopped");
    Ok(())
}

async fn start_control_plane(
    settings: &Settings,
    store: Arc<dyn SessionStore>,
) -> Result<ControlPlane<SystemClock>, LifecycleError> {
    let provider = build_provider(settings).await?;
    let config = ControlPlaneConfig {
        http_addr: settings.http_addr(),
        ingest_addr: settings.ingest_addr(),
        default_region: settings.region(),
        sandbox_domain: settings.sandbox_domain(),
        org_limit: settings.org_limit(),
        token_secret: settings.token_secret(),
        registry: RegistryOptions::default(),
        autoscaler: AutoscalerOptions {
            cooldown: settings.scale_cooldown(),
            ..AutoscalerOptions::default()
        },
    };
    ControlPlane::start(config, store, provider, SystemClock)
        .await
        .map_err(|e| LifecycleError::BadConfig(e.to_string()))
}

async fn build_provider(
    settings: &Settings,
) -> Result<Arc<dyn MachineProvider>, LifecycleError> {
    match settings.provider.as_deref() {
        Some("k8s") => {
            let namespace = settings
                .k8s_namespace
                .clone()
                .unwrap_or_else(|| "sbx".to_string());
            let regions: Vec<Region> = vec![settings.region()];
            let provider = K8sProvider::connect(namespace, regions)
                .await
                .map_err(|e| LifecycleError::BadConfig(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        Some("none") | None => Ok(Arc::new(NullProvider)),
        Some(other) => Err(LifecycleError::BadConfig(format!(
            "unknown provider {other:?}"
        ))),
    }
}

async fn start_worker(
    settings: &Settings,
    data_dir: &std::path::Path,
    store: Arc<dyn SessionStore>,
    objects: Arc<dyn ObjectStore>,
    sink: Arc<dyn sbx_worker::HeartbeatSink>,
) -> Result<Worker<SystemClock>, LifecycleError> {
    let config = WorkerConfig {
        worker_id: settings.worker_id(),
        machine_id: settings.machine_id(),
        region: settings.region(),
        rpc_addr: settings.rpc_addr(),
        http_addr: settings.worker_http_addr(),
        capacity: settings.max_capacity(),
        data_dir: data_dir.to_path_buf(),
        default_limits: settings.default_limits(),
        image_prefix: settings.image_prefix(),
    };
    Worker::start(
        config,
        store,
        objects,
        Arc::new(DockerRuntime::new()),
        sink,
        SystemClock,
        RouterOptions::default(),
    )
    .await
    .map_err(|e| LifecycleError::BadConfig(e.to_string()))
}
