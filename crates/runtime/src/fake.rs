// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory fakes for tests.
//!
//! `FakeRuntime` keeps containers as byte payloads and records every
//! call with start/end instants so tests can assert serialization
//! ordering. `FakeProvider` records machine lifecycle calls for the
//! autoscaler decision-table tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use sbx_core::{MachineId, Region, SandboxId};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapter::{ExecResult, RuntimeAdapter, RuntimeError, RuntimeStats, SandboxSpec};
use crate::provider::{Machine, MachineOpts, MachineProvider, MachineStatus, ProviderError};

/// One recorded adapter call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub sandbox_id: SandboxId,
    pub op: &'static str,
    pub started: Instant,
    pub ended: Instant,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    running: bool,
    payload: Vec<u8>,
    port: u16,
}

/// Call-logging in-memory runtime.
#[derive(Clone)]
pub struct FakeRuntime {
    containers: Arc<Mutex<HashMap<SandboxId, FakeContainer>>>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    fail_next: Arc<Mutex<HashMap<&'static str, VecDeque<RuntimeError>>>>,
    exec_hold: Arc<Mutex<Duration>>,
    port_counter: Arc<AtomicU16>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(Mutex::new(HashMap::new())),
            exec_hold: Arc::new(Mutex::new(Duration::ZERO)),
            port_counter: Arc::new(AtomicU16::new(9100)),
        }
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: &'static str, err: RuntimeError) {
        self.fail_next.lock().entry(op).or_default().push_back(err);
    }

    /// Make every `exec` hold its slot for `duration` (serialization tests).
    pub fn hold_exec(&self, duration: Duration) {
        *self.exec_hold.lock() = duration;
    }

    /// Set the container's visible filesystem bytes.
    pub fn set_payload(&self, sandbox_id: &SandboxId, payload: Vec<u8>) {
        if let Some(c) = self.containers.lock().get_mut(sandbox_id) {
            c.payload = payload;
        }
    }

    pub fn payload(&self, sandbox_id: &SandboxId) -> Option<Vec<u8>> {
        self.containers.lock().get(sandbox_id).map(|c| c.payload.clone())
    }

    pub fn container_exists(&self, sandbox_id: &SandboxId) -> bool {
        self.containers.lock().contains_key(sandbox_id)
    }

    pub fn is_running(&self, sandbox_id: &SandboxId) -> bool {
        self.containers
            .lock()
            .get(sandbox_id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Simulate a container dying outside the platform's control.
    pub fn kill_out_of_band(&self, sandbox_id: &SandboxId) {
        self.containers.lock().remove(sandbox_id);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Calls of one op kind, in order.
    pub fn calls_of(&self, op: &str) -> Vec<CallRecord> {
        self.calls.lock().iter().filter(|c| c.op == op).cloned().collect()
    }

    fn take_failure(&self, op: &'static str) -> Option<RuntimeError> {
        self.fail_next.lock().get_mut(op).and_then(VecDeque::pop_front)
    }

    fn record(&self, sandbox_id: &SandboxId, op: &'static str, started: Instant) {
        self.calls.lock().push(CallRecord {
            sandbox_id: *sandbox_id,
            op,
            started,
            ended: Instant::now(),
        });
    }

    fn with_container<T>(
        &self,
        sandbox_id: &SandboxId,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(sandbox_id)
            .ok_or(RuntimeError::NotFound(*sandbox_id))?;
        Ok(f(container))
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<(), RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("create") {
            return Err(err);
        }
        let port = self.port_counter.fetch_add(1, Ordering::Relaxed);
        self.containers.lock().insert(
            spec.sandbox_id,
            FakeContainer { running: false, payload: Vec::new(), port },
        );
        self.record(&spec.sandbox_id, "create", started);
        Ok(())
    }

    async fn start(&self, sandbox_id: &SandboxId) -> Result<(), RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("start") {
            return Err(err);
        }
        self.with_container(sandbox_id, |c| c.running = true)?;
        self.record(sandbox_id, "start", started);
        Ok(())
    }

    async fn stop(&self, sandbox_id: &SandboxId, _grace: Duration) -> Result<(), RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("stop") {
            return Err(err);
        }
        self.with_container(sandbox_id, |c| c.running = false)?;
        self.record(sandbox_id, "stop", started);
        Ok(())
    }

    async fn remove(&self, sandbox_id: &SandboxId) -> Result<(), RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("remove") {
            return Err(err);
        }
        self.containers
            .lock()
            .remove(sandbox_id)
            .ok_or(RuntimeError::NotFound(*sandbox_id))?;
        self.record(sandbox_id, "remove", started);
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &SandboxId,
        command: &[String],
    ) -> Result<ExecResult, RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("exec") {
            return Err(err);
        }
        self.with_container(sandbox_id, |c| {
            if !c.running {
                Err(RuntimeError::NotFound(*sandbox_id))
            } else {
                Ok(())
            }
        })??;
        let hold = *self.exec_hold.lock();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        self.record(sandbox_id, "exec", started);
        Ok(ExecResult {
            exit_code: 0,
            stdout: command.join(" "),
            stderr: String::new(),
        })
    }

    async fn stats(&self, sandbox_id: &SandboxId) -> Result<RuntimeStats, RuntimeError> {
        let started = Instant::now();
        let stats = self.with_container(sandbox_id, |c| RuntimeStats {
            cpu_pct: 1.0,
            mem_bytes: c.payload.len() as u64,
            mem_limit: 1024 * 1024 * 1024,
            pids: u32::from(c.running),
            net_in: 0,
            net_out: 0,
        })?;
        self.record(sandbox_id, "stats", started);
        Ok(stats)
    }

    async fn checkpoint(&self, sandbox_id: &SandboxId, sink: &Path) -> Result<(), RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("checkpoint") {
            return Err(err);
        }
        let payload = self.with_container(sandbox_id, |c| {
            c.running = false;
            c.payload.clone()
        })?;
        // Nothing is visible at the sink until the single write below
        // completes, matching the atomicity contract.
        std::fs::write(sink, &payload)
            .map_err(|e| RuntimeError::CheckpointFailed(e.to_string()))?;
        self.record(sandbox_id, "checkpoint", started);
        Ok(())
    }

    async fn restore(&self, sandbox_id: &SandboxId, source: &Path) -> Result<(), RuntimeError> {
        let started = Instant::now();
        if let Some(err) = self.take_failure("restore") {
            return Err(err);
        }
        let payload = std::fs::read(source)
            .map_err(|e| RuntimeError::RestoreFailed(e.to_string()))?;
        self.with_container(sandbox_id, |c| {
            c.payload = payload;
            c.running = true;
        })?;
        self.record(sandbox_id, "restore", started);
        Ok(())
    }

    async fn host_port(&self, sandbox_id: &SandboxId) -> Result<u16, RuntimeError> {
        self.with_container(sandbox_id, |c| c.port)
    }
}

/// Scripted machine provider with a call log.
#[derive(Clone)]
pub struct FakeProvider {
    regions: Vec<Region>,
    machines: Arc<Mutex<HashMap<MachineId, Machine>>>,
    calls: Arc<Mutex<Vec<String>>>,
    counter: Arc<AtomicU32>,
}

impl FakeProvider {
    pub fn new(regions: Vec<Region>) -> Self {
        Self {
            regions,
            machines: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            counter: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.machines.lock().keys().copied().collect()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MachineProvider for FakeProvider {
    async fn create(&self, opts: &MachineOpts) -> Result<Machine, ProviderError> {
        if !self.regions.contains(&opts.region) {
            return Err(ProviderError::UnsupportedRegion(opts.region.clone()));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let machine_id = MachineId::from_string(format!("mch-fake-{n}"));
        let machine = Machine {
            machine_id,
            addr: format!("10.0.0.{n}:7070"),
            region: opts.region.clone(),
            status: MachineStatus::Launching,
        };
        self.machines.lock().insert(machine_id, machine.clone());
        self.log(format!("create {} {}", opts.region, machine_id));
        Ok(machine)
    }

    async fn destroy(&self, machine_id: &MachineId) -> Result<(), ProviderError> {
        self.log(format!("destroy {machine_id}"));
        self.machines
            .lock()
            .remove(machine_id)
            .map(|_| ())
            .ok_or(ProviderError::NotFound(*machine_id))
    }

    async fn drain(&self, machine_id: &MachineId) -> Result<(), ProviderError> {
        self.log(format!("drain {machine_id}"));
        let mut machines = self.machines.lock();
        let machine = machines
            .get_mut(machine_id)
            .ok_or(ProviderError::NotFound(*machine_id))?;
        machine.status = MachineStatus::Draining;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Machine>, ProviderError> {
        Ok(self.machines.lock().values().cloned().collect())
    }

    async fn health(&self, machine_id: &MachineId) -> Result<MachineStatus, ProviderError> {
        self.machines
            .lock()
            .get(machine_id)
            .map(|m| m.status)
            .ok_or(ProviderError::NotFound(*machine_id))
    }

    fn supported_regions(&self) -> Vec<Region> {
        self.regions.clone()
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
