// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Placement service: admission, worker choice, sandbox creation,
//! destruction, and wake target selection.

use std::sync::Arc;
use std::time::Duration;

use sbx_core::{
    Clock, Fault, OrgId, Region, SandboxConfig, SandboxId, ScopedToken, SessionRecord,
    SessionStatus, WorkerId,
};
use sbx_store::{SessionStore, StoreError};
use sbx_wire::{Request, Response};
use tracing::{info, warn};

use crate::registry::Registry;

/// Container pull plus boot can run ≈35 s; give creates a wide berth.
const CREATE_DEADLINE: Duration = Duration::from_secs(60);
const DESTROY_DEADLINE: Duration = Duration::from_secs(30);
const HIBERNATE_DEADLINE: Duration = Duration::from_secs(120);
/// Cold restore of a large image over the network is the worst case.
pub const WAKE_DEADLINE: Duration = Duration::from_secs(90);
/// TAP probes are cheap; don't let a slow worker stall wake placement.
const TAP_PROBE_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub default_region: Region,
    /// Active sandboxes allowed per org.
    pub org_limit: usize,
    pub token_secret: String,
    /// Apex domain for subdomain routing, e.g. `sandboxes.example`.
    pub sandbox_domain: String,
}

/// Parsed creation request.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub org_id: OrgId,
    pub config: SandboxConfig,
    /// Region hint from a request header; lowest precedence.
    pub header_region: Option<Region>,
}

/// What a successful create hands back to the client.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub record: SessionRecord,
    pub connect_url: String,
    pub token: String,
}

pub struct Placement<C: Clock> {
    registry: Registry<C>,
    store: Arc<dyn SessionStore>,
    clock: C,
    config: PlacementConfig,
}

impl<C: Clock> Placement<C> {
    pub fn new(
        registry: Registry<C>,
        store: Arc<dyn SessionStore>,
        clock: C,
        config: PlacementConfig,
    ) -> Self {
        Self { registry, store, clock, config }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn resolve_region(&self, request: &CreateRequest) -> Region {
        request
            .config
            .region
            .clone()
            .or_else(|| request.header_region.clone())
            .unwrap_or_else(|| self.config.default_region.clone())
    }

    /// Admit, place, create on the worker, persist, and issue a token.
    pub async fn create_sandbox(&self, request: CreateRequest) -> Result<CreateOutcome, Fault> {
        let active = self
            .store
            .count_active_by_org(&request.org_id)
            .await
            .map_err(Fault::from)?;
        if active >= self.config.org_limit {
            return Err(Fault::quota(format!(
                "org {} has {active} active sandboxes (limit {})",
                request.org_id, self.config.org_limit
            )));
        }

        let region = self.resolve_region(&request);
        let Some(worker) = self.registry.pick(&region, 1) else {
            return Err(Fault::no_capacity(format!("no workers in region {region}")));
        };

        // The session row (with its worker) lands before the container
        // exists, so a wake or recovery never sees an ownerless
        // running sandbox.
        let sandbox_id = SandboxId::new();
        self.store
            .create_session(
                sandbox_id,
                request.org_id.clone(),
                worker.worker_id.clone(),
                worker.region.clone(),
                &request.config,
            )
            .await
            .map_err(Fault::from)?;

        let rpc = Request::CreateSandbox { sandbox_id, config: request.config.clone() };
        let outcome = self
            .registry
            .pool()
            .call(&worker.worker_id, &rpc, CREATE_DEADLINE)
            .await
            .and_then(|r| r.into_result().map_err(Fault::from));

        match outcome {
            Ok(Response::SandboxCreated { .. }) => {}
            Ok(other) => {
                self.abort_create(&sandbox_id, format!("unexpected response {other:?}"))
                    .await;
                return Err(Fault::upstream("malformed create response"));
            }
            Err(fault) => {
                self.abort_create(&sandbox_id, fault.to_string()).await;
                return Err(fault);
            }
        }

        let record = self.store.get_session(&sandbox_id).await.map_err(Fault::from)?;
        let token = ScopedToken::issue(
            request.org_id,
            sandbox_id,
            worker.worker_id.clone(),
            self.clock.epoch_ms(),
        )
        .sign(&self.config.token_secret);
        let connect_url = format!("https://{sandbox_id}.{}", self.config.sandbox_domain);

        info!(
            sandbox_id = %sandbox_id,
            worker_id = %worker.worker_id,
            region = %record.region,
            "sandbox placed"
        );
        Ok(CreateOutcome { record, connect_url, token })
    }

    async fn abort_create(&self, sandbox_id: &SandboxId, reason: String) {
        warn!(sandbox_id = %sandbox_id, reason = %reason, "create failed on worker");
        if let Err(e) = self
            .store
            .update_status(sandbox_id, SessionStatus::Error, Some(reason))
            .await
        {
            warn!(sandbox_id = %sandbox_id, error = %e, "abort status write failed");
        }
    }

    pub async fn get_sandbox(&self, sandbox_id: &SandboxId) -> Result<SessionRecord, Fault> {
        self.store.get_session(sandbox_id).await.map_err(Fault::from)
    }

    /// Destroy a sandbox. Idempotent; a lost worker degrades to a
    /// store-only stop with the reason recorded.
    pub async fn destroy_sandbox(&self, sandbox_id: &SandboxId) -> Result<(), Fault> {
        let session = match self.store.get_session(sandbox_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound(_)) => {
                return Err(Fault::not_found(format!("sandbox {sandbox_id} does not exist")))
            }
            Err(e) => return Err(e.into()),
        };
        if session.status == SessionStatus::Stopped {
            return Ok(());
        }

        let reachable_worker = session
            .worker_id
            .as_ref()
            .filter(|worker_id| self.registry.get(worker_id).is_some());

        match reachable_worker {
            Some(worker_id) => {
                let rpc = Request::DestroySandbox { sandbox_id: *sandbox_id };
                let result = self
                    .registry
                    .pool()
                    .call(worker_id, &rpc, DESTROY_DEADLINE)
                    .await
                    .and_then(|r| r.into_result().map_err(Fault::from));
                match result {
                    Ok(_) => {
                        // The worker already flipped the session; make
                        // sure even a racing failure converges.
                        let _ = self
                            .store
                            .update_status(sandbox_id, SessionStatus::Stopped, None)
                            .await;
                    }
                    Err(fault) => {
                        warn!(sandbox_id = %sandbox_id, error = %fault, "destroy rpc failed");
                        self.store
                            .update_status(
                                sandbox_id,
                                SessionStatus::Stopped,
                                Some("worker unreachable".to_string()),
                            )
                            .await
                            .map_err(Fault::from)?;
                    }
                }
            }
            None => {
                self.store
                    .update_status(
                        sandbox_id,
                        SessionStatus::Stopped,
                        Some("worker unreachable".to_string()),
                    )
                    .await
                    .map_err(Fault::from)?;
            }
        }
        Ok(())
    }

    /// Caller-initiated hibernate on the owning worker.
    pub async fn hibernate_sandbox(
        &self,
        sandbox_id: &SandboxId,
    ) -> Result<(String, u64), Fault> {
        let session = self.store.get_session(sandbox_id).await.map_err(Fault::from)?;
        if session.status == SessionStatus::Hibernated {
            let checkpoint = self
                .store
                .get_active_checkpoint(sandbox_id)
                .await
                .map_err(Fault::from)?;
            return Ok((checkpoint.blob_key, checkpoint.size_bytes));
        }
        if session.status != SessionStatus::Running {
            return Err(Fault::gone(format!(
                "sandbox {sandbox_id} is {}",
                session.status
            )));
        }
        let worker_id = session
            .worker_id
            .ok_or_else(|| Fault::invalid("running session without worker"))?;

        let rpc = Request::HibernateSandbox { sandbox_id: *sandbox_id };
        match self
            .registry
            .pool()
            .call(&worker_id, &rpc, HIBERNATE_DEADLINE)
            .await
            .and_then(|r| r.into_result().map_err(Fault::from))?
        {
            Response::Hibernated { checkpoint_key, size_bytes } => {
                Ok((checkpoint_key, size_bytes))
            }
            other => Err(Fault::upstream(format!("malformed hibernate response {other:?}"))),
        }
    }

    /// Choose a wake target and restore the sandbox there.
    ///
    /// Workers in the checkpoint's region are probed most-free first
    /// for a free TAP slot (a snapshot restore can only reuse its
    /// original NIC); the first hit wins, otherwise the least-loaded
    /// worker takes a cold restore.
    pub async fn wake_sandbox(&self, sandbox_id: &SandboxId) -> Result<SessionRecord, Fault> {
        let session = self.store.get_session(sandbox_id).await.map_err(Fault::from)?;
        match session.status {
            SessionStatus::Running => return Ok(session),
            SessionStatus::Hibernated => {}
            other => {
                return Err(Fault::gone(format!("sandbox {sandbox_id} is {other}")));
            }
        }
        let checkpoint = self
            .store
            .get_active_checkpoint(sandbox_id)
            .await
            .map_err(|_| Fault::not_found(format!("sandbox {sandbox_id} has no active checkpoint")))?;

        let candidates = self.registry.workers_in_region(&checkpoint.region);
        let mut target: Option<WorkerId> = None;
        for candidate in &candidates {
            let probe = Request::IsTapAvailable { sandbox_id: *sandbox_id };
            match self
                .registry
                .pool()
                .call(&candidate.worker_id, &probe, TAP_PROBE_DEADLINE)
                .await
            {
                Ok(Response::TapAvailability { available: true }) => {
                    target = Some(candidate.worker_id.clone());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id = %candidate.worker_id, error = %e, "TAP probe failed")
                }
            }
        }
        // Cold-restore fallback: most free capacity, any region if the
        // checkpoint's region is empty.
        let target = match target {
            Some(target) => target,
            None => candidates
                .first()
                .map(|b| b.worker_id.clone())
                .or_else(|| self.registry.pick(&checkpoint.region, 1).map(|b| b.worker_id))
                .ok_or_else(|| {
                    Fault::no_capacity(format!("no wake target in region {}", checkpoint.region))
                })?,
        };

        let rpc = Request::WakeSandbox {
            sandbox_id: *sandbox_id,
            checkpoint: checkpoint.clone(),
            timeout_secs: WAKE_DEADLINE.as_secs(),
        };
        match self
            .registry
            .pool()
            .call(&target, &rpc, WAKE_DEADLINE + Duration::from_secs(5))
            .await
            .and_then(|r| r.into_result().map_err(Fault::from))?
        {
            Response::Woken { .. } => {}
            other => return Err(Fault::upstream(format!("malformed wake response {other:?}"))),
        }

        info!(sandbox_id = %sandbox_id, worker_id = %target, "sandbox woken on demand");
        self.store.get_session(sandbox_id).await.map_err(Fault::from)
    }
}

#[cfg(test)]
#[path = "placement_tests.rs"]
mod tests;
