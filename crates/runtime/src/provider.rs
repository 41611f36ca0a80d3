// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud machine provider contract.

use async_trait::async_trait;
use sbx_core::{MachineId, Region};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("machine {0} not found")]
    NotFound(MachineId),

    #[error("region {0} not supported")]
    UnsupportedRegion(Region),

    #[error("provider failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Launching,
    Ready,
    Draining,
    Terminated,
}

/// One cloud machine as the provider sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: MachineId,
    pub addr: String,
    pub region: Region,
    pub status: MachineStatus,
}

/// Launch parameters for one worker machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineOpts {
    pub region: Region,
    /// Instance size label, provider-interpreted.
    pub size: String,
    /// Worker image to boot.
    pub image: String,
    /// Opaque reference to credentials the worker needs at boot.
    pub secrets_ref: Option<String>,
}

/// Create/destroy/drain cloud machines; region-aware. Cloud specifics
/// stay behind this surface.
#[async_trait]
pub trait MachineProvider: Send + Sync + 'static {
    async fn create(&self, opts: &MachineOpts) -> Result<Machine, ProviderError>;

    async fn destroy(&self, machine_id: &MachineId) -> Result<(), ProviderError>;

    /// Mark for graceful shutdown; the worker stops accepting new
    /// sandboxes and finishes or hibernates what it has.
    async fn drain(&self, machine_id: &MachineId) -> Result<(), ProviderError>;

    async fn list(&self) -> Result<Vec<Machine>, ProviderError>;

    async fn health(&self, machine_id: &MachineId) -> Result<MachineStatus, ProviderError>;

    fn supported_regions(&self) -> Vec<Region>;
}

/// Manual-capacity mode: no cloud control. The autoscaler still runs
/// but every decision is a no-op, so operators add and remove workers
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct NullProvider;

#[async_trait]
impl MachineProvider for NullProvider {
    async fn create(&self, opts: &MachineOpts) -> Result<Machine, ProviderError> {
        Err(ProviderError::UnsupportedRegion(opts.region.clone()))
    }

    async fn destroy(&self, machine_id: &MachineId) -> Result<(), ProviderError> {
        Err(ProviderError::NotFound(*machine_id))
    }

    async fn drain(&self, machine_id: &MachineId) -> Result<(), ProviderError> {
        Err(ProviderError::NotFound(*machine_id))
    }

    async fn list(&self) -> Result<Vec<Machine>, ProviderError> {
        Ok(Vec::new())
    }

    async fn health(&self, machine_id: &MachineId) -> Result<MachineStatus, ProviderError> {
        Err(ProviderError::NotFound(*machine_id))
    }

    fn supported_regions(&self) -> Vec<Region> {
        Vec::new()
    }
}
