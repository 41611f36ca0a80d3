// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hibernation service: checkpoint → pack → upload, and the reverse.
//!
//! One attempt per call. Retry policy and failure status transitions
//! belong to the router, so a failed attempt here leaves the session
//! status untouched; the success paths write `Hibernated` (hibernate)
//! and `Running` on the new worker (wake).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sbx_core::{CheckpointRecord, Clock, Fault, SandboxId, SessionStatus};
use sbx_runtime::{RuntimeAdapter, SandboxSpec};
use sbx_store::{checkpoint_key, ObjectStore, SessionStore};
use tracing::{info, warn};

use crate::config::WorkerConfig;

/// What a successful hibernate produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HibernateResult {
    pub checkpoint_key: String,
    pub size_bytes: u64,
}

pub struct Hibernator<C: Clock> {
    config: WorkerConfig,
    runtime: Arc<dyn RuntimeAdapter>,
    store: Arc<dyn SessionStore>,
    objects: Arc<dyn ObjectStore>,
    clock: C,
}

impl<C: Clock> Hibernator<C> {
    pub fn new(
        config: WorkerConfig,
        runtime: Arc<dyn RuntimeAdapter>,
        store: Arc<dyn SessionStore>,
        objects: Arc<dyn ObjectStore>,
        clock: C,
    ) -> Self {
        Self { config, runtime, store, objects, clock }
    }

    fn scratch(&self, name: &str) -> Result<PathBuf, Fault> {
        let dir = self.config.data_dir.join("scratch");
        std::fs::create_dir_all(&dir)
            .map_err(|e| Fault::checkpoint_failed(format!("scratch dir: {e}")))?;
        Ok(dir.join(name))
    }

    /// Checkpoint the sandbox, pack it sparsely, upload, and flip the
    /// session to `Hibernated`. The container is removed on success so
    /// the worker's slot frees up.
    pub async fn hibernate(&self, sandbox_id: &SandboxId) -> Result<HibernateResult, Fault> {
        let image = self.scratch(&format!("{sandbox_id}.image"))?;
        let packed = self.scratch(&format!("{sandbox_id}.packed"))?;

        let result = self.hibernate_inner(sandbox_id, &image, &packed).await;
        let _ = std::fs::remove_file(&image);
        let _ = std::fs::remove_file(&packed);
        result
    }

    async fn hibernate_inner(
        &self,
        sandbox_id: &SandboxId,
        image: &Path,
        packed: &Path,
    ) -> Result<HibernateResult, Fault> {
        self.runtime
            .checkpoint(sandbox_id, image)
            .await
            .map_err(Fault::from)?;

        let (image_owned, packed_owned) = (image.to_path_buf(), packed.to_path_buf());
        let summary = tokio::task::spawn_blocking(move || {
            sbx_store::pack(&image_owned, &packed_owned)
        })
        .await
        .map_err(|e| Fault::checkpoint_failed(format!("pack task: {e}")))?
        .map_err(|e| Fault::checkpoint_failed(format!("pack: {e}")))?;

        let key = checkpoint_key(&self.config.region, sandbox_id, self.clock.epoch_secs());
        self.objects
            .put_file(&key, packed)
            .await
            .map_err(|e| Fault::checkpoint_failed(format!("upload: {e}")))?;

        self.store
            .record_checkpoint(
                sandbox_id,
                key.clone(),
                self.config.region.clone(),
                summary.packed_size,
            )
            .await
            .map_err(Fault::from)?;
        self.store
            .update_status(sandbox_id, SessionStatus::Hibernated, None)
            .await
            .map_err(Fault::from)?;

        // The checkpoint left the process tree stopped; drop the
        // container so capacity frees up. Failure here is cosmetic.
        if let Err(e) = self.runtime.remove(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, error = %e, "container remove after checkpoint failed");
        }

        info!(
            sandbox_id = %sandbox_id,
            key = %key,
            logical = summary.logical_size,
            packed = summary.packed_size,
            blocks = summary.blocks,
            "sandbox hibernated"
        );
        Ok(HibernateResult { checkpoint_key: key, size_bytes: summary.packed_size })
    }

    /// Download, unpack into a sparse image, restore, verify, and move
    /// session ownership to this worker.
    pub async fn wake(
        &self,
        sandbox_id: &SandboxId,
        checkpoint: &CheckpointRecord,
        spec: SandboxSpec,
        timeout: Duration,
    ) -> Result<(), Fault> {
        tokio::time::timeout(timeout, self.wake_inner(sandbox_id, checkpoint, spec))
            .await
            .map_err(|_| Fault::timeout(format!("wake of {sandbox_id} exceeded {timeout:?}")))?
    }

    async fn wake_inner(
        &self,
        sandbox_id: &SandboxId,
        checkpoint: &CheckpointRecord,
        spec: SandboxSpec,
    ) -> Result<(), Fault> {
        let packed = self.scratch(&format!("{sandbox_id}.wake.packed"))?;
        let image = self.scratch(&format!("{sandbox_id}.wake.image"))?;

        let result = async {
            self.objects
                .get_file(&checkpoint.blob_key, &packed)
                .await
                .map_err(|e| match e {
                    sbx_store::ObjectStoreError::NotFound(key) => {
                        Fault::not_found(format!("checkpoint blob {key} missing"))
                    }
                    other => Fault::restore_failed(format!("download: {other}")),
                })?;

            let (packed_owned, image_owned) = (packed.clone(), image.clone());
            tokio::task::spawn_blocking(move || sbx_store::unpack(&packed_owned, &image_owned))
                .await
                .map_err(|e| Fault::restore_failed(format!("unpack task: {e}")))?
                .map_err(|e| Fault::restore_failed(format!("unpack: {e}")))?;

            // A stale container shell from a previous life would make
            // create fail; clear it first.
            let _ = self.runtime.remove(sandbox_id).await;
            self.runtime
                .create(&spec)
                .await
                .map_err(|e| Fault::restore_failed(e.to_string()))?;
            self.runtime
                .restore(sandbox_id, &image)
                .await
                .map_err(Fault::from)?;

            // Reachability probe before the session flips to Running.
            self.runtime
                .stats(sandbox_id)
                .await
                .map_err(|e| Fault::restore_failed(format!("post-restore probe: {e}")))?;

            self.store
                .reassign_worker(sandbox_id, self.config.worker_id.clone())
                .await
                .map_err(Fault::from)?;
            self.store
                .mark_checkpoint_restored(sandbox_id)
                .await
                .map_err(Fault::from)?;

            info!(
                sandbox_id = %sandbox_id,
                key = %checkpoint.blob_key,
                worker_id = %self.config.worker_id,
                "sandbox woken"
            );
            Ok(())
        }
        .await;

        let _ = std::fs::remove_file(&packed);
        let _ = std::fs::remove_file(&image);
        result
    }
}

#[cfg(test)]
#[path = "hibernate_tests.rs"]
mod tests;
