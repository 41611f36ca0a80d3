// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed session store.
//!
//! State is held in memory under one mutex (which serializes writes)
//! and persisted as a JSON snapshot after every mutation, with `.bak`
//! rotation so a torn write never loses the previous good copy.
//! Worker keys are TTL-bound liveness hints and are not persisted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sbx_core::{
    CheckpointId, CheckpointRecord, Clock, Heartbeat, OrgId, Region, SandboxConfig, SandboxId,
    SessionRecord, SessionStatus, SystemClock, WorkerId,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::{SessionStore, StoreError};

const MAX_BAK_FILES: u32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    /// When this snapshot was written.
    #[serde(default = "Utc::now")]
    saved_at: DateTime<Utc>,
    sessions: HashMap<SandboxId, SessionRecord>,
    checkpoints: HashMap<SandboxId, Vec<CheckpointRecord>>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            saved_at: Utc::now(),
            sessions: HashMap::new(),
            checkpoints: HashMap::new(),
        }
    }
}

struct Inner {
    state: PersistedState,
    worker_keys: HashMap<WorkerId, (Heartbeat, u64)>,
}

/// Session store over a JSON snapshot file (or pure memory for tests).
pub struct FileStore<C: Clock = SystemClock> {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    clock: C,
}

impl FileStore<SystemClock> {
    /// Open (or create) the store at `data_dir/sessions.json`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        Self::open_with_clock(data_dir, SystemClock)
    }

    /// Memory-only store for tests and combined-mode smoke runs.
    pub fn in_memory() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<C: Clock> FileStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: PersistedState::default(),
                worker_keys: HashMap::new(),
            }),
            path: None,
            clock,
        }
    }

    pub fn open_with_clock(data_dir: &Path, clock: C) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join("sessions.json");
        let state = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            PersistedState::default()
        };
        Ok(Self {
            inner: Mutex::new(Inner { state, worker_keys: HashMap::new() }),
            path: Some(path),
            clock,
        })
    }

    /// Persist outside the lock; a failed write keeps serving from
    /// memory and logs rather than failing the mutation.
    fn persist(&self, snapshot: &PersistedState) {
        let Some(path) = &self.path else { return };
        let result = (|| -> Result<(), StoreError> {
            let bytes = serde_json::to_vec_pretty(snapshot)?;
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &bytes)?;
            if path.exists() {
                let _ = fs::rename(path, rotate_bak_path(path));
            }
            fs::rename(&tmp, path)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "session snapshot write failed");
        }
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PersistedState, u64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now_ms = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let out = f(&mut inner.state, now_ms)?;
        let snapshot = clone_state(&inner.state);
        drop(inner);
        self.persist(&snapshot);
        Ok(out)
    }
}

fn clone_state(state: &PersistedState) -> PersistedState {
    PersistedState {
        saved_at: Utc::now(),
        sessions: state.sessions.clone(),
        checkpoints: state.checkpoints.clone(),
    }
}

/// Pick the next `.bak` / `.bak.N` path, rotating older backups out.
fn rotate_bak_path(path: &Path) -> PathBuf {
    let bak = |n: u32| {
        if n == 1 {
            path.with_extension("bak")
        } else {
            path.with_extension(format!("bak.{n}"))
        }
    };

    let oldest = bak(MAX_BAK_FILES);
    if oldest.exists() {
        let _ = fs::remove_file(&oldest);
    }
    for n in (1..MAX_BAK_FILES).rev() {
        let src = bak(n);
        if src.exists() {
            let _ = fs::rename(&src, bak(n + 1));
        }
    }
    bak(1)
}

#[async_trait]
impl<C: Clock> SessionStore for FileStore<C> {
    async fn create_session(
        &self,
        sandbox_id: SandboxId,
        org_id: OrgId,
        worker_id: WorkerId,
        region: Region,
        config: &SandboxConfig,
    ) -> Result<SessionRecord, StoreError> {
        self.mutate(|state, now_ms| {
            if state.sessions.contains_key(&sandbox_id) {
                return Err(StoreError::AlreadyExists(sandbox_id));
            }
            let record = SessionRecord {
                sandbox_id,
                org_id,
                template: config.template.clone(),
                region,
                worker_id: Some(worker_id),
                status: SessionStatus::Creating,
                idle_seconds: config.idle_seconds,
                max_seconds: config.max_seconds,
                on_timeout: config.on_timeout,
                created_at_ms: now_ms,
                last_active_at_ms: now_ms,
                error: None,
            };
            state.sessions.insert(sandbox_id, record.clone());
            Ok(record)
        })
    }

    async fn get_session(&self, sandbox_id: &SandboxId) -> Result<SessionRecord, StoreError> {
        let inner = self.inner.lock();
        inner
            .state
            .sessions
            .get(sandbox_id)
            .cloned()
            .ok_or(StoreError::NotFound(*sandbox_id))
    }

    async fn update_status(
        &self,
        sandbox_id: &SandboxId,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.mutate(|state, now_ms| {
            let record = state
                .sessions
                .get_mut(sandbox_id)
                .ok_or(StoreError::NotFound(*sandbox_id))?;
            if !record.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    sandbox_id: *sandbox_id,
                    from: record.status,
                    to: status,
                });
            }
            record.status = status;
            record.last_active_at_ms = now_ms;
            if error.is_some() {
                record.error = error;
            }
            Ok(())
        })
    }

    async fn reassign_worker(
        &self,
        sandbox_id: &SandboxId,
        worker_id: WorkerId,
    ) -> Result<(), StoreError> {
        self.mutate(|state, now_ms| {
            let record = state
                .sessions
                .get_mut(sandbox_id)
                .ok_or(StoreError::NotFound(*sandbox_id))?;
            if !record.status.can_transition_to(SessionStatus::Running) {
                return Err(StoreError::InvalidTransition {
                    sandbox_id: *sandbox_id,
                    from: record.status,
                    to: SessionStatus::Running,
                });
            }
            record.worker_id = Some(worker_id);
            record.status = SessionStatus::Running;
            record.last_active_at_ms = now_ms;
            record.error = None;
            Ok(())
        })
    }

    async fn record_checkpoint(
        &self,
        sandbox_id: &SandboxId,
        blob_key: String,
        region: Region,
        size_bytes: u64,
    ) -> Result<CheckpointRecord, StoreError> {
        self.mutate(|state, now_ms| {
            if !state.sessions.contains_key(sandbox_id) {
                return Err(StoreError::NotFound(*sandbox_id));
            }
            let row = CheckpointRecord {
                checkpoint_id: CheckpointId::new(),
                sandbox_id: *sandbox_id,
                blob_key,
                region,
                size_bytes,
                created_at_ms: now_ms,
                restored_at_ms: None,
            };
            state
                .checkpoints
                .entry(*sandbox_id)
                .or_default()
                .push(row.clone());
            Ok(row)
        })
    }

    async fn mark_checkpoint_restored(&self, sandbox_id: &SandboxId) -> Result<(), StoreError> {
        self.mutate(|state, now_ms| {
            let rows = state
                .checkpoints
                .get_mut(sandbox_id)
                .ok_or(StoreError::NoActiveCheckpoint(*sandbox_id))?;
            let latest_active = rows
                .iter_mut()
                .rev()
                .find(|row| row.is_active())
                .ok_or(StoreError::NoActiveCheckpoint(*sandbox_id))?;
            latest_active.restored_at_ms = Some(now_ms);
            Ok(())
        })
    }

    async fn get_active_checkpoint(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<CheckpointRecord, StoreError> {
        let inner = self.inner.lock();
        inner
            .state
            .checkpoints
            .get(sandbox_id)
            .and_then(|rows| rows.iter().rev().find(|row| row.is_active()))
            .cloned()
            .ok_or(StoreError::NoActiveCheckpoint(*sandbox_id))
    }

    async fn count_active_by_org(&self, org_id: &OrgId) -> Result<usize, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .sessions
            .values()
            .filter(|s| &s.org_id == org_id && s.is_active())
            .count())
    }

    async fn list_sessions_by_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .sessions
            .values()
            .filter(|s| s.worker_id.as_ref() == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn put_worker_key(&self, beat: Heartbeat, ttl: Duration) -> Result<(), StoreError> {
        let expires_at_ms = self.clock.epoch_ms() + ttl.as_millis() as u64;
        let mut inner = self.inner.lock();
        inner
            .worker_keys
            .insert(beat.worker_id.clone(), (beat, expires_at_ms));
        Ok(())
    }

    async fn list_worker_keys(&self) -> Result<Vec<Heartbeat>, StoreError> {
        let now_ms = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        inner.worker_keys.retain(|_, (_, expires)| *expires > now_ms);
        Ok(inner.worker_keys.values().map(|(beat, _)| beat.clone()).collect())
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
