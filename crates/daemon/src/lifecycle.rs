// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup/shutdown plumbing: data-dir locking, logging, and
//! the shutdown signal.

use fs2::FileExt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no usable state directory (set SBX_DATA_DIR)")]
    NoStateDir,

    #[error("configuration error: {0}")]
    BadConfig(String),

    #[error("another daemon owns {0}")]
    AlreadyRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive lock on the data dir; dropped on exit.
pub struct DirLock {
    _file: File,
}

/// Take the daemon lock so two daemons never share session state.
pub fn lock_data_dir(data_dir: &Path) -> Result<DirLock, LifecycleError> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("sbxd.lock");
    let file = File::create(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| LifecycleError::AlreadyRunning(path.display().to_string()))?;
    Ok(DirLock { _file: file })
}

/// Install tracing: stderr plus a rolling file in the data dir.
/// Returns the appender guard; dropping it flushes buffered logs.
pub fn init_logging(data_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(&log_dir, "sbxd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let filter = tracing_subscriber::EnvFilter::try_from_env("SBX_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    Ok(guard)
}

/// Resolve on SIGTERM or ctrl-c.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
