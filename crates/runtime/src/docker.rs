// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Docker runtime adapter.
//!
//! Containers are driven through the Docker CLI (the daemon socket is
//! not assumed to be reachable as an API). Each sandbox maps one host
//! port to the container's service port; checkpoint/restore uses the
//! experimental `docker checkpoint` (CRIU) support, with the image
//! directory tarred into a single artifact so the hibernation service
//! can treat it as one blob.

use async_trait::async_trait;
use parking_lot::Mutex;
use sbx_core::SandboxId;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Output;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::adapter::{ExecResult, RuntimeAdapter, RuntimeError, RuntimeStats, SandboxSpec};

const CONTAINER_PORT: u16 = 8080;
const CHECKPOINT_NAME: &str = "hib";
const CLI_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime adapter over the Docker CLI.
pub struct DockerRuntime {
    ports: Arc<Mutex<HashMap<SandboxId, u16>>>,
    port_counter: AtomicU16,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        let base_port: u16 = std::env::var("SBX_DOCKER_BASE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9100);
        Self {
            ports: Arc::new(Mutex::new(HashMap::new())),
            port_counter: AtomicU16::new(base_port),
        }
    }

    fn next_port(&self) -> u16 {
        self.port_counter.fetch_add(1, Ordering::Relaxed)
    }
}

fn container_name(sandbox_id: &SandboxId) -> String {
    format!("sbx-{}", sandbox_id.as_str())
}

/// Run one docker CLI invocation with a timeout.
async fn run_docker(args: &[&str]) -> Result<Output, RuntimeError> {
    debug!(args = ?args, "docker");
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(args);
    let output = tokio::time::timeout(CLI_TIMEOUT, cmd.output())
        .await
        .map_err(|_| RuntimeError::Timeout(format!("docker {}", args.join(" "))))?
        .map_err(|e| RuntimeError::Failed(format!("docker spawn: {e}")))?;
    Ok(output)
}

/// Classify a failed CLI invocation by its stderr.
fn classify(sandbox_id: &SandboxId, args: &[&str], output: &Output) -> RuntimeError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such container") || stderr.contains("is not running") {
        RuntimeError::NotFound(*sandbox_id)
    } else {
        RuntimeError::Failed(format!(
            "docker {} failed (exit {:?}): {}",
            args.join(" "),
            output.status.code(),
            stderr.trim()
        ))
    }
}

async fn run_checked(sandbox_id: &SandboxId, args: &[&str]) -> Result<Output, RuntimeError> {
    let output = run_docker(args).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(classify(sandbox_id, args, &output))
    }
}

/// One row of `docker stats --no-stream --format "{{json .}}"`.
#[derive(Debug, Deserialize)]
struct DockerStatsRow {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "NetIO")]
    net_io: String,
    #[serde(rename = "PIDs")]
    pids: String,
}

/// Parse `"0.15%"`.
fn parse_pct(s: &str) -> f32 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse `"7.27MiB"`, `"1.944GiB"`, `"796B"`, `"1.2kB"`.
fn parse_bytes(s: &str) -> u64 {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let value: f64 = s[..split].parse().unwrap_or(0.0);
    let unit = &s[split..];
    let scale: f64 = match unit {
        "B" | "" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * scale) as u64
}

/// Parse `"7.27MiB / 1.944GiB"` into (used, limit).
fn parse_pair(s: &str) -> (u64, u64) {
    let mut parts = s.splitn(2, '/');
    let a = parse_bytes(parts.next().unwrap_or(""));
    let b = parse_bytes(parts.next().unwrap_or(""));
    (a, b)
}

fn parse_stats(json_row: &str) -> Result<RuntimeStats, RuntimeError> {
    let row: DockerStatsRow = serde_json::from_str(json_row)
        .map_err(|e| RuntimeError::Failed(format!("docker stats parse: {e}")))?;
    let (mem_bytes, mem_limit) = parse_pair(&row.mem_usage);
    let (net_in, net_out) = parse_pair(&row.net_io);
    Ok(RuntimeStats {
        cpu_pct: parse_pct(&row.cpu_perc),
        mem_bytes,
        mem_limit,
        pids: row.pids.trim().parse().unwrap_or(0),
        net_in,
        net_out,
    })
}

/// Build `docker create` arguments for a spec. Pure for testability.
fn create_args(spec: &SandboxSpec, host_port: u16) -> Vec<String> {
    let name = container_name(&spec.sandbox_id);
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name,
        "-p".to_string(),
        format!("{host_port}:{CONTAINER_PORT}"),
        "--memory".to_string(),
        format!("{}m", spec.limits.memory_mb),
        "--cpus".to_string(),
        spec.limits.cpus.to_string(),
        "--label".to_string(),
        format!("sbx.sandbox={}", spec.sandbox_id),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<(), RuntimeError> {
        let host_port = self.next_port();
        let args = create_args(spec, host_port);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked(&spec.sandbox_id, &arg_refs).await?;
        self.ports.lock().insert(spec.sandbox_id, host_port);
        Ok(())
    }

    async fn start(&self, sandbox_id: &SandboxId) -> Result<(), RuntimeError> {
        run_checked(sandbox_id, &["start", &container_name(sandbox_id)]).await?;
        Ok(())
    }

    async fn stop(&self, sandbox_id: &SandboxId, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = grace.as_secs().to_string();
        run_checked(
            sandbox_id,
            &["stop", "-t", &grace_secs, &container_name(sandbox_id)],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, sandbox_id: &SandboxId) -> Result<(), RuntimeError> {
        run_checked(sandbox_id, &["rm", "-f", &container_name(sandbox_id)]).await?;
        self.ports.lock().remove(sandbox_id);
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &SandboxId,
        command: &[String],
    ) -> Result<ExecResult, RuntimeError> {
        let name = container_name(sandbox_id);
        let mut args = vec!["exec", name.as_str()];
        args.extend(command.iter().map(String::as_str));
        let output = run_docker(&args).await?;
        if !output.status.success() && !String::from_utf8_lossy(&output.stderr).is_empty() {
            // Distinguish a dead container from a failing command.
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") || stderr.contains("is not running") {
                return Err(RuntimeError::NotFound(*sandbox_id));
            }
        }
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stats(&self, sandbox_id: &SandboxId) -> Result<RuntimeStats, RuntimeError> {
        let name = container_name(sandbox_id);
        let output = run_checked(
            sandbox_id,
            &["stats", "--no-stream", "--format", "{{json .}}", &name],
        )
        .await?;
        parse_stats(String::from_utf8_lossy(&output.stdout).trim())
    }

    async fn checkpoint(&self, sandbox_id: &SandboxId, sink: &Path) -> Result<(), RuntimeError> {
        let name = container_name(sandbox_id);
        let workdir = tempfile_dir(sandbox_id)?;
        let workdir_str = workdir.to_string_lossy().into_owned();

        run_checked(
            sandbox_id,
            &[
                "checkpoint",
                "create",
                "--checkpoint-dir",
                &workdir_str,
                &name,
                CHECKPOINT_NAME,
            ],
        )
        .await
        .map_err(|e| match e {
            RuntimeError::NotFound(id) => RuntimeError::NotFound(id),
            other => RuntimeError::CheckpointFailed(other.to_string()),
        })?;

        // CRIU writes an image directory; collapse it into one artifact.
        let sink_str = sink.to_string_lossy().into_owned();
        let output = tokio::process::Command::new("tar")
            .args(["-C", &workdir_str, "-cf", &sink_str, CHECKPOINT_NAME])
            .output()
            .await
            .map_err(|e| RuntimeError::CheckpointFailed(format!("tar spawn: {e}")))?;
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        if !output.status.success() {
            return Err(RuntimeError::CheckpointFailed(format!(
                "tar failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn restore(&self, sandbox_id: &SandboxId, source: &Path) -> Result<(), RuntimeError> {
        let name = container_name(sandbox_id);
        let workdir = tempfile_dir(sandbox_id)?;
        let workdir_str = workdir.to_string_lossy().into_owned();
        let source_str = source.to_string_lossy().into_owned();

        let output = tokio::process::Command::new("tar")
            .args(["-C", &workdir_str, "-xf", &source_str])
            .output()
            .await
            .map_err(|e| RuntimeError::RestoreFailed(format!("tar spawn: {e}")))?;
        if !output.status.success() {
            return Err(RuntimeError::RestoreFailed(format!(
                "untar failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let result = run_checked(
            sandbox_id,
            &[
                "start",
                "--checkpoint",
                CHECKPOINT_NAME,
                "--checkpoint-dir",
                &workdir_str,
                &name,
            ],
        )
        .await;
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        result.map_err(|e| match e {
            RuntimeError::NotFound(id) => RuntimeError::NotFound(id),
            other => RuntimeError::RestoreFailed(other.to_string()),
        })?;
        Ok(())
    }

    async fn host_port(&self, sandbox_id: &SandboxId) -> Result<u16, RuntimeError> {
        if let Some(port) = self.ports.lock().get(sandbox_id).copied() {
            return Ok(port);
        }
        // Worker restarted since create: ask docker for the mapping.
        let name = container_name(sandbox_id);
        let spec = format!("{CONTAINER_PORT}/tcp");
        let output = run_checked(sandbox_id, &["port", &name, &spec]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let port = text
            .lines()
            .next()
            .and_then(|line| line.rsplit(':').next())
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or_else(|| RuntimeError::Failed(format!("unparseable port mapping: {text}")))?;
        self.ports.lock().insert(*sandbox_id, port);
        Ok(port)
    }
}

fn tempfile_dir(sandbox_id: &SandboxId) -> Result<std::path::PathBuf, RuntimeError> {
    let dir = std::env::temp_dir().join(format!("sbx-ckpt-{}", sandbox_id.as_str()));
    std::fs::create_dir_all(&dir)
        .map_err(|e| RuntimeError::Failed(format!("checkpoint workdir: {e}")))?;
    Ok(dir)
}

#[cfg(test)]
#[path = "docker_tests.rs"]
mod tests;
