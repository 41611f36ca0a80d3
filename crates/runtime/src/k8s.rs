// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Kubernetes machine provider.
//!
//! Each "machine" is a worker pod. Identity flows through labels:
//! `sbx.io/role=worker` selects the fleet, `sbx.io/machine` carries the
//! machine ID, and the worker learns its own identity and region from
//! injected environment variables so heartbeats register it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, Pod, PodSpec, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use sbx_core::{MachineId, Region};
use std::collections::BTreeMap;
use tracing::info;

use crate::provider::{Machine, MachineOpts, MachineProvider, MachineStatus, ProviderError};

const ROLE_LABEL: &str = "sbx.io/role";
const MACHINE_LABEL: &str = "sbx.io/machine";
const REGION_LABEL: &str = "sbx.io/region";
const DRAIN_ANNOTATION: &str = "sbx.io/drain";

/// Machine provider that runs workers as pods in one namespace.
pub struct K8sProvider {
    client: kube::Client,
    namespace: String,
    regions: Vec<Region>,
}

impl K8sProvider {
    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn connect(
        namespace: impl Into<String>,
        regions: Vec<Region>,
    ) -> Result<Self, ProviderError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| ProviderError::Failed(format!("kube client: {e}")))?;
        Ok(Self { client, namespace: namespace.into(), regions })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn find_pod(&self, machine_id: &MachineId) -> Result<Pod, ProviderError> {
        let selector = format!("{MACHINE_LABEL}={}", pod_safe(machine_id.as_str()));
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| ProviderError::Failed(format!("pod list: {e}")))?;
        pods.items
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(*machine_id))
    }
}

/// Lowercase DNS-safe form of an ID for names and label values.
fn pod_safe(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => 'x',
        })
        .collect()
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Build the worker pod for one machine.
fn build_worker_pod(machine_id: &MachineId, opts: &MachineOpts) -> Pod {
    let safe_id = pod_safe(machine_id.as_str());
    let mut labels = BTreeMap::new();
    labels.insert(ROLE_LABEL.to_string(), "worker".to_string());
    labels.insert(MACHINE_LABEL.to_string(), safe_id.clone());
    labels.insert(REGION_LABEL.to_string(), opts.region.to_string());

    let mut env = vec![
        env_var("SBX_MODE", "worker"),
        env_var("SBX_MACHINE_ID", machine_id.as_str()),
        env_var("SBX_REGION", opts.region.as_str()),
        env_var("SBX_WORKER_SIZE", &opts.size),
    ];

    // Worker credentials (object store, control plane) from a Secret.
    if let Some(ref secret_name) = opts.secrets_ref {
        env.push(EnvVar {
            name: "SBX_TOKEN_SECRET".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.clone(),
                    key: "token-secret".to_string(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("sbx-worker-{safe_id}")),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".to_string(),
                image: Some(opts.image.clone()),
                env: Some(env),
                ports: Some(vec![
                    ContainerPort { container_port: 7070, name: Some("rpc".into()), ..Default::default() },
                    ContainerPort { container_port: 7071, name: Some("http".into()), ..Default::default() },
                ]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn machine_from_pod(pod: &Pod) -> Option<Machine> {
    let labels = pod.metadata.labels.as_ref()?;
    let machine_id = MachineId::from_string(labels.get(MACHINE_LABEL)?);
    let region = Region::new(labels.get(REGION_LABEL)?);
    let addr = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    Some(Machine {
        machine_id,
        addr,
        region,
        status: pod_status(pod),
    })
}

fn pod_status(pod: &Pod) -> MachineStatus {
    if pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DRAIN_ANNOTATION))
        .is_some()
    {
        return MachineStatus::Draining;
    }
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => MachineStatus::Ready,
        Some("Succeeded") | Some("Failed") => MachineStatus::Terminated,
        _ => MachineStatus::Launching,
    }
}

#[async_trait]
impl MachineProvider for K8sProvider {
    async fn create(&self, opts: &MachineOpts) -> Result<Machine, ProviderError> {
        if !self.regions.contains(&opts.region) {
            return Err(ProviderError::UnsupportedRegion(opts.region.clone()));
        }
        let machine_id = MachineId::new();
        let pod = build_worker_pod(&machine_id, opts);
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| ProviderError::Failed(format!("pod create: {e}")))?;
        info!(machine_id = %machine_id, region = %opts.region, "worker pod created");
        Ok(Machine {
            machine_id,
            addr: String::new(),
            region: opts.region.clone(),
            status: MachineStatus::Launching,
        })
    }

    async fn destroy(&self, machine_id: &MachineId) -> Result<(), ProviderError> {
        let pod = self.find_pod(machine_id).await?;
        let name = pod.metadata.name.unwrap_or_default();
        self.pods()
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| ProviderError::Failed(format!("pod delete: {e}")))?;
        info!(machine_id = %machine_id, "worker pod deleted");
        Ok(())
    }

    async fn drain(&self, machine_id: &MachineId) -> Result<(), ProviderError> {
        let pod = self.find_pod(machine_id).await?;
        let name = pod.metadata.name.unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": { "annotations": { DRAIN_ANNOTATION: "true" } }
        });
        self.pods()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ProviderError::Failed(format!("pod patch: {e}")))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Machine>, ProviderError> {
        let selector = format!("{ROLE_LABEL}=worker");
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| ProviderError::Failed(format!("pod list: {e}")))?;
        Ok(pods.items.iter().filter_map(machine_from_pod).collect())
    }

    async fn health(&self, machine_id: &MachineId) -> Result<MachineStatus, ProviderError> {
        let pod = self.find_pod(machine_id).await?;
        Ok(pod_status(&pod))
    }

    fn supported_regions(&self) -> Vec<Region> {
        self.regions.clone()
    }
}

#[cfg(test)]
#[path = "k8s_tests.rs"]
mod tests;
