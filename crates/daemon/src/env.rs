// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized configuration for the daemon.
//!
//! Settings come from an optional TOML file (`SBX_CONFIG`) with `SBX_*`
//! environment variables taking precedence, so machine providers can
//! inject identity without touching files.

use sbx_core::{MachineId, Region, ResourceLimits, WorkerId};
use serde::Deserialize;
use std::path::PathBuf;

use crate::lifecycle::LifecycleError;

/// Which planes this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Worker,
    Combined,
}

impl std::str::FromStr for Mode {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Mode::Server),
            "worker" => Ok(Mode::Worker),
            "combined" => Ok(Mode::Combined),
            other => Err(LifecycleError::BadConfig(format!("unknown mode {other:?}"))),
        }
    }
}

/// File-shaped settings; every field has an env override.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub mode: Option<String>,
    pub region: Option<String>,
    pub worker_id: Option<String>,
    pub machine_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub default_memory_mb: Option<u64>,
    pub default_cpus: Option<u32>,
    pub default_disk_mb: Option<u64>,
    pub sandbox_domain: Option<String>,
    pub max_capacity: Option<u32>,
    pub scale_cooldown_sec: Option<u64>,
    pub http_addr: Option<String>,
    pub rpc_addr: Option<String>,
    pub worker_http_addr: Option<String>,
    pub ingest_addr: Option<String>,
    /// Control-plane ingest address a standalone worker pushes to.
    pub cp_addr: Option<String>,
    pub token_secret: Option<String>,
    pub org_limit: Option<usize>,
    pub image_prefix: Option<String>,
    pub provider: Option<String>,
    pub k8s_namespace: Option<String>,
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.parse().ok())
}

impl Settings {
    /// Read the optional config file, then apply env overrides.
    pub fn load() -> Result<Self, LifecycleError> {
        let mut settings = match env_str("SBX_CONFIG") {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    LifecycleError::BadConfig(format!("read {path}: {e}"))
                })?;
                toml::from_str(&text)
                    .map_err(|e| LifecycleError::BadConfig(format!("parse {path}: {e}")))?
            }
            None => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub(crate) fn apply_env(&mut self) {
        if let Some(v) = env_str("SBX_MODE") {
            self.mode = Some(v);
        }
        if let Some(v) = env_str("SBX_REGION") {
            self.region = Some(v);
        }
        if let Some(v) = env_str("SBX_WORKER_ID") {
            self.worker_id = Some(v);
        }
        if let Some(v) = env_str("SBX_MACHINE_ID") {
            self.machine_id = Some(v);
        }
        if let Some(v) = env_str("SBX_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse("SBX_DEFAULT_MEMORY_MB") {
            self.default_memory_mb = Some(v);
        }
        if let Some(v) = env_parse("SBX_DEFAULT_CPUS") {
            self.default_cpus = Some(v);
        }
        if let Some(v) = env_parse("SBX_DEFAULT_DISK_MB") {
            self.default_disk_mb = Some(v);
        }
        if let Some(v) = env_str("SBX_SANDBOX_DOMAIN") {
            self.sandbox_domain = Some(v);
        }
        if let Some(v) = env_parse("SBX_MAX_CAPACITY") {
            self.max_capacity = Some(v);
        }
        if let Some(v) = env_parse("SBX_SCALE_COOLDOWN_SEC") {
            self.scale_cooldown_sec = Some(v);
        }
        if let Some(v) = env_str("SBX_HTTP_ADDR") {
            self.http_addr = Some(v);
        }
        if let Some(v) = env_str("SBX_RPC_ADDR") {
            self.rpc_addr = Some(v);
        }
        if let Some(v) = env_str("SBX_WORKER_HTTP_ADDR") {
            self.worker_http_addr = Some(v);
        }
        if let Some(v) = env_str("SBX_INGEST_ADDR") {
            self.ingest_addr = Some(v);
        }
        if let Some(v) = env_str("SBX_CP_ADDR") {
            self.cp_addr = Some(v);
        }
        if let Some(v) = env_str("SBX_TOKEN_SECRET") {
            self.token_secret = Some(v);
        }
        if let Some(v) = env_parse("SBX_ORG_LIMIT") {
            self.org_limit = Some(v);
        }
        if let Some(v) = env_str("SBX_IMAGE_PREFIX") {
            self.image_prefix = Some(v);
        }
        if let Some(v) = env_str("SBX_PROVIDER") {
            self.provider = Some(v);
        }
        if let Some(v) = env_str("SBX_K8S_NAMESPACE") {
            self.k8s_namespace = Some(v);
        }
    }

    pub fn mode(&self) -> Result<Mode, LifecycleError> {
        self.mode.as_deref().unwrap_or("combined").parse()
    }

    pub fn region(&self) -> Region {
        self.region.as_deref().map(Region::new).unwrap_or_default()
    }

    /// Worker identity, defaulting to the hostname so restarts on the
    /// same machine keep the same ID.
    pub fn worker_id(&self) -> WorkerId {
        if let Some(id) = &self.worker_id {
            return WorkerId::new(id);
        }
        let hostname = std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "worker-local".to_string());
        WorkerId::new(hostname)
    }

    pub fn machine_id(&self) -> MachineId {
        match &self.machine_id {
            Some(id) => MachineId::from_string(id),
            None => MachineId::from_string(format!("mch-{}", self.worker_id())),
        }
    }

    /// Resolve the data directory: setting > XDG state home > ~/.local/state/sbx
    pub fn data_dir(&self) -> Result<PathBuf, LifecycleError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::state_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
            .map(|base| base.join("sbx"))
            .ok_or(LifecycleError::NoStateDir)
    }

    pub fn default_limits(&self) -> ResourceLimits {
        let defaults = ResourceLimits::default();
        ResourceLimits {
            memory_mb: self.default_memory_mb.unwrap_or(defaults.memory_mb),
            cpus: self.default_cpus.unwrap_or(defaults.cpus),
            disk_mb: self.default_disk_mb.unwrap_or(defaults.disk_mb),
        }
    }

    pub fn sandbox_domain(&self) -> String {
        self.sandbox_domain
            .clone()
            .unwrap_or_else(|| "sandboxes.localhost".to_string())
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity.unwrap_or(16)
    }

    pub fn http_addr(&self) -> String {
        self.http_addr.clone().unwrap_or_else(|| "0.0.0.0:8080".to_string())
    }

    pub fn rpc_addr(&self) -> String {
        self.rpc_addr.clone().unwrap_or_else(|| "0.0.0.0:7070".to_string())
    }

    pub fn worker_http_addr(&self) -> String {
        self.worker_http_addr
            .clone()
            .unwrap_or_else(|| "0.0.0.0:7071".to_string())
    }

    pub fn ingest_addr(&self) -> String {
        self.ingest_addr.clone().unwrap_or_else(|| "0.0.0.0:7080".to_string())
    }

    pub fn cp_addr(&self) -> String {
        self.cp_addr.clone().unwrap_or_else(|| "127.0.0.1:7080".to_string())
    }

    pub fn token_secret(&self) -> String {
        self.token_secret
            .clone()
            .unwrap_or_else(|| "insecure-dev-secret".to_string())
    }

    pub fn org_limit(&self) -> usize {
        self.org_limit.unwrap_or(32)
    }

    pub fn image_prefix(&self) -> String {
        self.image_prefix.clone().unwrap_or_else(|| "sbx-".to_string())
    }

    pub fn scale_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scale_cooldown_sec.unwrap_or(300))
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
