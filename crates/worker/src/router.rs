// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sandbox router: per-sandbox serialization and rolling timeouts.
//!
//! Each sandbox on this worker owns one slot: an activity clock, an
//! idle window, an absolute max deadline, and a mutex that serializes
//! every operation touching the sandbox. Routed calls for different
//! sandboxes run in parallel; calls for the same sandbox queue on the
//! slot mutex, so a command can never observe a half-hibernated
//! sandbox.
//!
//! A single background ticker sweeps all slots and applies the
//! session's timeout policy when a deadline passes. Hibernated
//! sandboxes are woken transparently when a call routes to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sbx_core::{
    CheckpointRecord, Clock, ErrorKind, Fault, SandboxId, SessionStatus, TimeoutPolicy,
};
use sbx_runtime::RuntimeAdapter;
use sbx_store::SessionStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::hibernate::{HibernateResult, Hibernator};
use crate::tap::TapSlots;

/// Why a sandbox was killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    /// Idle window elapsed under a `Kill` policy.
    IdleTimeout,
    /// Absolute lifetime cap reached under a `Kill` policy.
    MaxLifetime,
    /// The container died outside the platform's control.
    OutOfBand,
    /// Hibernate retries exhausted; the failure reason is carried.
    HibernateFailed(String),
    /// Explicit destroy request.
    Destroyed,
    /// Worker shutting down without applying the timeout policy.
    Shutdown,
}

/// Embedder callbacks for authoritative bookkeeping.
///
/// The hibernation service writes the store on success; kills are
/// reported here so the embedder decides the final status (stopped for
/// policy kills and destroys, error for failures).
pub trait RouterEvents: Send + Sync + 'static {
    fn on_hibernate(&self, sandbox_id: &SandboxId, result: &HibernateResult);
    fn on_kill(&self, sandbox_id: &SandboxId, reason: KillReason);
}

/// Tuning knobs; defaults match production behavior.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Fixed ticker interval override (tests). Production derives
    /// `min(1s, shortest idle window / 10)` per tick.
    pub tick_interval: Option<Duration>,
    /// Sleeps between hibernate retries.
    pub hibernate_backoff: Vec<Duration>,
    /// Deadline for wakes triggered by routing.
    pub wake_timeout: Duration,
    /// Grace given to `stop` before a kill removes the container.
    pub kill_grace: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            tick_interval: None,
            hibernate_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
            wake_timeout: Duration::from_secs(90),
            kill_grace: Duration::from_secs(5),
        }
    }
}

struct SlotState {
    last_activity: Instant,
    idle: Duration,
    max_deadline: Instant,
    /// The cap fixed at slot creation; `set_timeout` cannot move the
    /// deadline past it.
    hard_max_deadline: Instant,
    created_at: Instant,
    policy: TimeoutPolicy,
}

struct Slot {
    serial: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn touch(&self, now: Instant) {
        self.state.lock().last_activity = now;
    }
}

struct RouterInner<C: Clock> {
    config: WorkerConfig,
    slots: Mutex<HashMap<SandboxId, Arc<Slot>>>,
    /// Serializes concurrent wakes of the same sandbox (two requests
    /// can race to wake it before any slot exists).
    waking: Mutex<HashMap<SandboxId, Arc<tokio::sync::Mutex<()>>>>,
    runtime: Arc<dyn RuntimeAdapter>,
    store: Arc<dyn SessionStore>,
    hibernator: Hibernator<C>,
    taps: Arc<TapSlots>,
    events: Arc<dyn RouterEvents>,
    clock: C,
    options: RouterOptions,
    cancel: CancellationToken,
    closed: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Router<C: Clock>(Arc<RouterInner<C>>);

impl<C: Clock> Router<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        runtime: Arc<dyn RuntimeAdapter>,
        store: Arc<dyn SessionStore>,
        hibernator: Hibernator<C>,
        taps: Arc<TapSlots>,
        events: Arc<dyn RouterEvents>,
        clock: C,
        options: RouterOptions,
    ) -> Self {
        Self(Arc::new(RouterInner {
            config,
            slots: Mutex::new(HashMap::new()),
            waking: Mutex::new(HashMap::new()),
            runtime,
            store,
            hibernator,
            taps,
            events,
            clock,
            options,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            ticker: Mutex::new(None),
        }))
    }

    /// Spawn the background deadline ticker.
    pub fn start(&self) {
        let router = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let tick = router.tick_interval();
                tokio::select! {
                    _ = router.0.cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => router.sweep().await,
                }
            }
        });
        *self.0.ticker.lock() = Some(handle);
    }

    pub fn slot_count(&self) -> usize {
        self.0.slots.lock().len()
    }

    pub fn has_slot(&self, sandbox_id: &SandboxId) -> bool {
        self.0.slots.lock().contains_key(sandbox_id)
    }

    pub fn taps(&self) -> &TapSlots {
        &self.0.taps
    }

    fn slot(&self, sandbox_id: &SandboxId) -> Option<Arc<Slot>> {
        self.0.slots.lock().get(sandbox_id).cloned()
    }

    /// `min(1s, shortest idle window / 10)` so short windows are
    /// checked often enough to fire within 10% of their length.
    fn tick_interval(&self) -> Duration {
        if let Some(fixed) = self.0.options.tick_interval {
            return fixed;
        }
        let shortest_idle = self
            .0
            .slots
            .lock()
            .values()
            .map(|slot| slot.state.lock().idle)
            .min()
            .unwrap_or(Duration::from_secs(10));
        (shortest_idle / 10).min(Duration::from_secs(1)).max(Duration::from_millis(10))
    }

    /// Create the slot for a sandbox now live on this worker (fresh
    /// create, post-wake, or restart recovery).
    pub fn register_slot(
        &self,
        sandbox_id: SandboxId,
        idle: Duration,
        max: Duration,
        policy: TimeoutPolicy,
    ) {
        let now = self.0.clock.now();
        // Saturate absurd caps instead of overflowing Instant math.
        let max_deadline = now
            .checked_add(max)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));
        let slot = Arc::new(Slot {
            serial: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(SlotState {
                last_activity: now,
                idle,
                max_deadline,
                hard_max_deadline: max_deadline,
                created_at: now,
                policy,
            }),
        });
        self.0.slots.lock().insert(sandbox_id, slot);
    }

    fn remove_slot(&self, sandbox_id: &SandboxId) {
        self.0.slots.lock().remove(sandbox_id);
        self.0.taps.release(sandbox_id);
    }

    /// Route one operation to a sandbox, waking it if hibernated.
    ///
    /// The closure runs under the sandbox's serial mutex with the
    /// activity clock refreshed first. Errors from the closure pass
    /// through unchanged, except a runtime-level "not found" on an
    /// active slot, which tears the slot down and surfaces `Gone`.
    pub async fn route<F, Fut, T>(
        &self,
        sandbox_id: SandboxId,
        op: &'static str,
        f: F,
    ) -> Result<T, Fault>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, Fault>> + Send,
        T: Send,
    {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(Fault::gone("router is closed"));
        }

        // The slot can vanish between lookup and lock when a timeout
        // fires concurrently; retry the acquisition once.
        let mut attempts = 0;
        let (slot, _guard) = loop {
            attempts += 1;
            let slot = match self.slot(&sandbox_id) {
                Some(slot) => slot,
                None => self.admit(&sandbox_id).await?,
            };
            let guard = slot.serial.clone().lock_owned().await;
            if self.has_slot(&sandbox_id) {
                break (slot, guard);
            }
            if attempts >= 2 {
                return Err(Fault::gone(format!("sandbox {sandbox_id} is gone")));
            }
        };
        slot.touch(self.0.clock.now());

        tracing::debug!(sandbox_id = %sandbox_id, op, "routing");
        let result = f().await;

        if let Err(fault) = &result {
            if fault.kind() == ErrorKind::NotFound && !self.container_alive(&sandbox_id).await {
                warn!(sandbox_id = %sandbox_id, "container died out of band");
                self.remove_slot(&sandbox_id);
                self.0.events.on_kill(&sandbox_id, KillReason::OutOfBand);
                return Err(Fault::gone(format!(
                    "sandbox {sandbox_id} container died out of band"
                )));
            }
        }
        result
    }

    /// Like [`Router::route`] but fails with `Busy` instead of waiting
    /// when another operation holds the sandbox.
    pub async fn try_route<F, Fut, T>(
        &self,
        sandbox_id: SandboxId,
        op: &'static str,
        f: F,
    ) -> Result<T, Fault>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, Fault>> + Send,
        T: Send,
    {
        let slot = self
            .slot(&sandbox_id)
            .ok_or_else(|| Fault::not_found(format!("sandbox {sandbox_id} has no slot")))?;
        let Ok(_guard) = slot.serial.clone().try_lock_owned() else {
            return Err(Fault::busy(format!("sandbox {sandbox_id} is busy")));
        };
        if !self.has_slot(&sandbox_id) {
            return Err(Fault::gone(format!("sandbox {sandbox_id} is gone")));
        }
        slot.touch(self.0.clock.now());
        tracing::debug!(sandbox_id = %sandbox_id, op, "routing (non-blocking)");
        f().await
    }

    async fn container_alive(&self, sandbox_id: &SandboxId) -> bool {
        self.0.runtime.stats(sandbox_id).await.is_ok()
    }

    /// No slot exists: consult the session store and either wake a
    /// hibernated sandbox, recover a running one after a worker
    /// restart, or fail with the appropriate kind.
    async fn admit(&self, sandbox_id: &SandboxId) -> Result<Arc<Slot>, Fault> {
        let session = self
            .0
            .store
            .get_session(sandbox_id)
            .await
            .map_err(|_| Fault::not_found(format!("sandbox {sandbox_id} does not exist")))?;

        match session.status {
            SessionStatus::Stopped | SessionStatus::Error => {
                Err(Fault::gone(format!("sandbox {sandbox_id} is {}", session.status)))
            }
            SessionStatus::Hibernated => {
                let checkpoint = self
                    .0
                    .store
                    .get_active_checkpoint(sandbox_id)
                    .await
                    .map_err(|_| {
                        Fault::not_found(format!("sandbox {sandbox_id} has no active checkpoint"))
                    })?;
                self.wake(sandbox_id, &checkpoint, self.0.options.wake_timeout)
                    .await?;
                self.slot(sandbox_id)
                    .ok_or_else(|| Fault::gone(format!("sandbox {sandbox_id} is gone")))
            }
            SessionStatus::Creating | SessionStatus::Running => {
                // Restart recovery: the session says we own it. Rebuild
                // the slot if the container survived.
                if self.container_alive(sandbox_id).await {
                    self.0.taps.claim(sandbox_id);
                    self.register_slot(
                        *sandbox_id,
                        session.idle_timeout(),
                        session.max_lifetime(),
                        session.on_timeout,
                    );
                    self.slot(sandbox_id)
                        .ok_or_else(|| Fault::gone(format!("sandbox {sandbox_id} is gone")))
                } else {
                    self.0.events.on_kill(sandbox_id, KillReason::OutOfBand);
                    Err(Fault::gone(format!("sandbox {sandbox_id} container is lost")))
                }
            }
        }
    }

    /// Update deadlines. The absolute cap fixed at slot creation can
    /// only be tightened, never extended.
    pub fn set_timeout(
        &self,
        sandbox_id: &SandboxId,
        idle: Duration,
        max: Duration,
        policy: TimeoutPolicy,
    ) -> Result<(), Fault> {
        let slot = self
            .slot(sandbox_id)
            .ok_or_else(|| Fault::not_found(format!("sandbox {sandbox_id} has no slot")))?;
        let mut state = slot.state.lock();
        state.idle = idle;
        state.max_deadline = state
            .created_at
            .checked_add(max)
            .map(|deadline| deadline.min(state.hard_max_deadline))
            .unwrap_or(state.hard_max_deadline);
        state.policy = policy;
        Ok(())
    }

    /// Caller-initiated hibernate: one attempt, error propagated, slot
    /// kept on failure so the sandbox stays routable.
    pub async fn hibernate(&self, sandbox_id: &SandboxId) -> Result<HibernateResult, Fault> {
        let slot = self
            .slot(sandbox_id)
            .ok_or_else(|| Fault::not_found(format!("sandbox {sandbox_id} has no slot")))?;
        let _guard = slot.serial.clone().lock_owned().await;
        if !self.has_slot(sandbox_id) {
            return Err(Fault::gone(format!("sandbox {sandbox_id} is gone")));
        }
        let result = self.0.hibernator.hibernate(sandbox_id).await?;
        self.remove_slot(sandbox_id);
        self.0.events.on_hibernate(sandbox_id, &result);
        Ok(result)
    }

    /// Restore a hibernated sandbox onto this worker. Validates the
    /// TAP slot before any transfer starts; on failure no slot is
    /// created and the session stays `Hibernated`.
    pub async fn wake(
        &self,
        sandbox_id: &SandboxId,
        checkpoint: &CheckpointRecord,
        timeout: Duration,
    ) -> Result<(), Fault> {
        let wake_lock = {
            let mut waking = self.0.waking.lock();
            Arc::clone(waking.entry(*sandbox_id).or_default())
        };
        let _wake_guard = wake_lock.lock().await;
        let result = self.wake_locked(sandbox_id, checkpoint, timeout).await;
        self.0.waking.lock().remove(sandbox_id);
        result
    }

    async fn wake_locked(
        &self,
        sandbox_id: &SandboxId,
        checkpoint: &CheckpointRecord,
        timeout: Duration,
    ) -> Result<(), Fault> {
        if self.has_slot(sandbox_id) {
            // Lost a wake race; the sandbox is already live here.
            return Ok(());
        }
        if !self.0.taps.is_available(sandbox_id) {
            return Err(Fault::no_capacity(format!(
                "TAP slot for {sandbox_id} is occupied on {}",
                self.0.config.worker_id
            )));
        }
        let session = self
            .0
            .store
            .get_session(sandbox_id)
            .await
            .map_err(Fault::from)?;
        if session.status.is_terminal() {
            return Err(Fault::gone(format!("sandbox {sandbox_id} is stopped")));
        }

        let spec = sbx_runtime::SandboxSpec {
            sandbox_id: *sandbox_id,
            image: self.0.config.image_for(&session.template),
            limits: self.0.config.default_limits,
            env: Default::default(),
        };

        self.0.taps.claim(sandbox_id);
        match self
            .0
            .hibernator
            .wake(sandbox_id, checkpoint, spec, timeout)
            .await
        {
            Ok(()) => {
                self.register_slot(
                    *sandbox_id,
                    session.idle_timeout(),
                    session.max_lifetime(),
                    session.on_timeout,
                );
                Ok(())
            }
            Err(fault) => {
                self.0.taps.release(sandbox_id);
                Err(fault)
            }
        }
    }

    /// Stop and remove a sandbox. Idempotent: destroying an absent
    /// sandbox succeeds.
    pub async fn destroy(&self, sandbox_id: &SandboxId) -> Result<(), Fault> {
        let Some(slot) = self.slot(sandbox_id) else {
            // No slot; clear any stray container.
            let _ = self.0.runtime.remove(sandbox_id).await;
            return Ok(());
        };
        let _guard = slot.serial.clone().lock_owned().await;
        if !self.has_slot(sandbox_id) {
            return Ok(());
        }
        self.kill(sandbox_id, KillReason::Destroyed).await;
        Ok(())
    }

    /// Sweep every slot against its deadlines, applying the timeout
    /// policy where one passed. Driven by the background ticker; tests
    /// call it directly after advancing the clock.
    pub async fn sweep(&self) {
        let now = self.0.clock.now();
        let expired: Vec<(SandboxId, KillReason)> = {
            let slots = self.0.slots.lock();
            slots
                .iter()
                .filter_map(|(id, slot)| {
                    let state = slot.state.lock();
                    if now >= state.max_deadline {
                        Some((*id, KillReason::MaxLifetime))
                    } else if now.duration_since(state.last_activity) > state.idle {
                        Some((*id, KillReason::IdleTimeout))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (sandbox_id, reason) in expired {
            self.expire(&sandbox_id, reason).await;
        }
    }

    async fn expire(&self, sandbox_id: &SandboxId, reason: KillReason) {
        let Some(slot) = self.slot(sandbox_id) else { return };
        let _guard = slot.serial.clone().lock_owned().await;
        if !self.has_slot(sandbox_id) {
            return;
        }
        // Re-check under the lock: a routed call may have refreshed the
        // activity clock while we waited.
        let (still_expired, policy) = {
            let state = slot.state.lock();
            let now = self.0.clock.now();
            let expired = now >= state.max_deadline
                || now.duration_since(state.last_activity) > state.idle;
            (expired, state.policy)
        };
        if !still_expired {
            return;
        }

        info!(sandbox_id = %sandbox_id, reason = ?reason, policy = ?policy, "timeout fired");
        match policy {
            TimeoutPolicy::Hibernate => self.hibernate_with_retry(sandbox_id).await,
            TimeoutPolicy::Kill => self.kill(sandbox_id, reason).await,
        }
    }

    /// Policy hibernate with exponential backoff; exhaustion kills the
    /// sandbox and reports the failure (no keep-alive fallback, the
    /// deadline has already passed).
    async fn hibernate_with_retry(&self, sandbox_id: &SandboxId) {
        let mut last_error = None;
        for (attempt, backoff) in std::iter::once(None)
            .chain(self.0.options.hibernate_backoff.iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = backoff {
                tokio::time::sleep(*delay).await;
            }
            match self.0.hibernator.hibernate(sandbox_id).await {
                Ok(result) => {
                    self.remove_slot(sandbox_id);
                    self.0.events.on_hibernate(sandbox_id, &result);
                    return;
                }
                Err(fault) => {
                    warn!(
                        sandbox_id = %sandbox_id,
                        attempt = attempt + 1,
                        error = %fault,
                        "auto-hibernate attempt failed"
                    );
                    last_error = Some(fault);
                }
            }
        }
        let reason = last_error
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.kill(sandbox_id, KillReason::HibernateFailed(reason))
            .await;
    }

    /// Best-effort stop/remove, slot teardown, and kill notification.
    /// Callers hold the slot's serial mutex.
    async fn kill(&self, sandbox_id: &SandboxId, reason: KillReason) {
        if let Err(e) = self.0.runtime.stop(sandbox_id, self.0.options.kill_grace).await {
            tracing::debug!(sandbox_id = %sandbox_id, error = %e, "stop during kill");
        }
        if let Err(e) = self.0.runtime.remove(sandbox_id).await {
            tracing::debug!(sandbox_id = %sandbox_id, error = %e, "remove during kill");
        }
        self.remove_slot(sandbox_id);
        self.0.events.on_kill(sandbox_id, reason);
    }

    /// Stop the ticker, drain in-flight calls, and optionally apply
    /// each survivor's timeout policy before returning.
    pub async fn close(&self, apply_policy: bool) {
        self.0.closed.store(true, Ordering::Release);
        self.0.cancel.cancel();
        if let Some(handle) = self.0.ticker.lock().take() {
            handle.abort();
        }

        let survivors: Vec<SandboxId> = self.0.slots.lock().keys().copied().collect();
        for sandbox_id in survivors {
            let Some(slot) = self.slot(&sandbox_id) else { continue };
            // Waits out any in-flight operation on the sandbox.
            let _guard = slot.serial.clone().lock_owned().await;
            if !self.has_slot(&sandbox_id) {
                continue;
            }
            if apply_policy {
                let policy = slot.state.lock().policy;
                match policy {
                    TimeoutPolicy::Hibernate => self.hibernate_with_retry(&sandbox_id).await,
                    TimeoutPolicy::Kill => self.kill(&sandbox_id, KillReason::Shutdown).await,
                }
            } else {
                self.remove_slot(&sandbox_id);
            }
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
