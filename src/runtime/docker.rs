//! Docker implementation of [`ContainerRuntime`], shelling out to the
//! `docker` CLI.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use super::traits::{
    ContainerRuntime, LaunchSpec, LaunchedContainer, LocalImageInfo, SelfInspection,
};
use crate::core::Gpu;

/// How long to wait for a fresh container to obtain an IP.
const IP_WAIT: Duration = Duration::from_secs(20);

/// Docker CLI runtime.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime {
    /// Name filter used to find our own container when containerised.
    self_name: String,
}

impl DockerRuntime {
    /// Create a runtime that identifies its own container by the given name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            self_name: "sealskin".to_owned(),
        }
    }

    async fn docker(args: &[&str]) -> anyhow::Result<std::process::Output> {
        Ok(Command::new("docker").args(args).output().await?)
    }

    /// Build the `docker run` argument list for a launch (exposed for tests).
    #[must_use]
    pub fn build_run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_owned(),
            "-d".to_owned(),
            "--rm".to_owned(),
            "--shm-size".to_owned(),
            spec.shm_size.clone().unwrap_or_else(|| "1g".to_owned()),
        ];

        for (key, value) in &spec.env {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }

        for mount in &spec.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("-v".to_owned());
            args.push(format!(
                "{}:{}:{mode}",
                mount.host_path.display(),
                mount.container_path.display()
            ));
        }

        match &spec.gpu {
            Some(Gpu::Nvidia { index }) => {
                args.push("--runtime".to_owned());
                args.push("nvidia".to_owned());
                args.push("--gpus".to_owned());
                args.push(format!(
                    "\"device={index},capabilities=compute,video,graphics,utility\""
                ));
            }
            Some(Gpu::Dri3 { device }) => {
                args.push("--device".to_owned());
                args.push(format!("{device}:{device}"));
            }
            None => {}
        }

        args.push(spec.image.clone());
        args
    }

    async fn container_ip(&self, instance_id: &str) -> anyhow::Result<Option<String>> {
        let output = Self::docker(&[
            "inspect",
            "-f",
            "{{json .NetworkSettings.Networks}}",
            instance_id,
        ])
        .await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker inspect failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let networks: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let Some(map) = networks.as_object() else {
            return Ok(None);
        };

        // Prefer the default bridge, fall back to any network with an address.
        let from_bridge = map
            .get("bridge")
            .and_then(|n| n.get("IPAddress"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        if let Some(ip) = from_bridge {
            return Ok(Some(ip.to_owned()));
        }
        Ok(map
            .values()
            .filter_map(|n| n.get("IPAddress").and_then(|v| v.as_str()))
            .find(|s| !s.is_empty())
            .map(str::to_owned))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> anyhow::Result<()> {
        tracing::info!(image, "pulling image");
        let output = Self::docker(&["pull", image]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to pull image '{image}': {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        tracing::info!(image, "pull complete");
        Ok(())
    }

    async fn local_info(&self, image: &str) -> anyhow::Result<Option<LocalImageInfo>> {
        let output = Self::docker(&[
            "image",
            "inspect",
            image,
            "--format",
            "{{.Id}} {{json .RepoDigests}}",
        ])
        .await?;
        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some((id, digests_json)) = stdout.trim().split_once(' ') else {
            return Ok(None);
        };
        let digests: Vec<String> = serde_json::from_str(digests_json).unwrap_or_default();
        let short_id = id
            .rsplit(':')
            .next()
            .unwrap_or(id)
            .chars()
            .take(12)
            .collect();
        Ok(Some(LocalImageInfo { short_id, digests }))
    }

    async fn remote_digest(&self, image: &str) -> anyhow::Result<Option<String>> {
        let output = Self::docker(&["manifest", "inspect", "--verbose", image]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no such manifest") || stderr.contains("not found") {
                tracing::warn!(image, "image not found in remote registry");
            } else {
                tracing::error!(image, error = %stderr.trim(), "remote manifest inspect failed");
            }
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        // Multi-arch images produce an array of per-platform entries.
        let entry = match &value {
            serde_json::Value::Array(items) => items.first(),
            other => Some(other),
        };
        Ok(entry
            .and_then(|e| e.get("Descriptor"))
            .and_then(|d| d.get("digest"))
            .and_then(|d| d.as_str())
            .map(str::to_owned))
    }

    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedContainer> {
        if self.local_info(&spec.image).await?.is_none() {
            tracing::info!(image = %spec.image, "image not found locally, pulling");
            self.pull(&spec.image).await?;
        }

        let args = Self::build_run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = Self::docker(&arg_refs).await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let instance_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        tracing::info!(
            instance = %instance_id.chars().take(12).collect::<String>(),
            image = %spec.image,
            "launched container"
        );

        // The address shows up shortly after start; poll briefly.
        let deadline = tokio::time::Instant::now() + IP_WAIT;
        loop {
            if let Some(ip) = self.container_ip(&instance_id).await? {
                return Ok(LaunchedContainer { instance_id, ip });
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.stop(&instance_id).await;
                anyhow::bail!("container {instance_id} did not obtain an IP address");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()> {
        let output = Self::docker(&["stop", "-t", "5", instance_id]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                tracing::warn!(instance = instance_id, "container already gone on stop");
                return Ok(());
            }
            tracing::error!(instance = instance_id, error = %stderr.trim(), "error stopping container");
            anyhow::bail!("failed to stop container {instance_id}");
        }
        tracing::info!(instance = instance_id, "stopped container");
        Ok(())
    }

    async fn exists(&self, instance_id: &str) -> anyhow::Result<bool> {
        let output = Self::docker(&["inspect", "-f", "{{.Id}}", instance_id]).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such object") || stderr.contains("No such container") {
            return Ok(false);
        }
        anyhow::bail!("docker inspect failed for {instance_id}: {}", stderr.trim())
    }

    async fn inspect_self(&self) -> anyhow::Result<Option<SelfInspection>> {
        if !Path::new("/var/run/docker.sock").exists() {
            tracing::info!("docker socket not found, assuming running on host");
            return Ok(None);
        }

        let by_name = Self::docker(&[
            "ps",
            "--filter",
            &format!("name={}", self.self_name),
            "--format",
            "{{.ID}}",
        ])
        .await?;
        let mut container_id = String::from_utf8_lossy(&by_name.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .to_owned();

        if container_id.is_empty() {
            // Inside a container the hostname defaults to the container id.
            let hostname = std::fs::read_to_string("/etc/hostname")
                .map(|h| h.trim().to_owned())
                .unwrap_or_default();
            if hostname.is_empty() {
                return Ok(None);
            }
            let check = Self::docker(&["inspect", "-f", "{{.Id}}", &hostname]).await?;
            if !check.status.success() {
                tracing::warn!(
                    "could not find self-container by name or hostname, path remapping disabled"
                );
                return Ok(None);
            }
            container_id = hostname;
        }

        let output = Self::docker(&[
            "inspect",
            "-f",
            "{{json .Mounts}} {{json .NetworkSettings.Ports}}",
            &container_id,
        ])
        .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some((mounts_json, ports_json)) = stdout.trim().split_once(' ') else {
            return Ok(None);
        };

        let mut inspection = SelfInspection::default();
        if let Ok(mounts) = serde_json::from_str::<serde_json::Value>(mounts_json) {
            for mount in mounts.as_array().into_iter().flatten() {
                let source = mount.get("Source").and_then(|v| v.as_str());
                let destination = mount.get("Destination").and_then(|v| v.as_str());
                if let (Some(source), Some(destination)) = (source, destination) {
                    inspection
                        .mounts
                        .push((destination.into(), source.into()));
                }
            }
        }
        if let Ok(ports) = serde_json::from_str::<serde_json::Value>(ports_json) {
            for (key, bindings) in ports.as_object().into_iter().flatten() {
                let container_port = key
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                let host_port = bindings
                    .as_array()
                    .and_then(|b| b.first())
                    .and_then(|b| b.get("HostPort"))
                    .and_then(|p| p.as_str())
                    .and_then(|p| p.parse::<u16>().ok());
                if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                    inspection.port_bindings.insert(container_port, host_port);
                }
            }
        }

        tracing::info!(
            mounts = inspection.mounts.len(),
            ports = inspection.port_bindings.len(),
            "inspected own container"
        );
        Ok(Some(inspection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::traits::Mount;
    use std::collections::BTreeMap;

    fn spec() -> LaunchSpec {
        let mut env = BTreeMap::new();
        env.insert("SUBFOLDER".to_owned(), "/sid/".to_owned());
        LaunchSpec {
            image: "lscr.io/linuxserver/firefox:latest".to_owned(),
            env,
            mounts: vec![Mount::rw("/storage/alice/work", "/config")],
            gpu: None,
            shm_size: None,
        }
    }

    #[test]
    fn run_args_include_env_and_mounts() {
        let args = DockerRuntime::build_run_args(&spec());
        assert_eq!(args[0], "run");
        assert!(args.contains(&"-d".to_owned()));
        assert!(args.contains(&"--rm".to_owned()));
        assert!(args.contains(&"SUBFOLDER=/sid/".to_owned()));
        assert!(args.contains(&"/storage/alice/work:/config:rw".to_owned()));
        assert_eq!(args.last().unwrap(), "lscr.io/linuxserver/firefox:latest");
    }

    #[test]
    fn run_args_default_shm_size() {
        let args = DockerRuntime::build_run_args(&spec());
        let idx = args.iter().position(|a| a == "--shm-size").unwrap();
        assert_eq!(args[idx + 1], "1g");
    }

    #[test]
    fn run_args_nvidia_gpu() {
        let mut spec = spec();
        spec.gpu = Some(Gpu::Nvidia { index: 1 });
        let args = DockerRuntime::build_run_args(&spec);
        assert!(args.contains(&"--runtime".to_owned()));
        assert!(args.contains(&"nvidia".to_owned()));
        assert!(args.iter().any(|a| a.contains("device=1")));
    }

    #[test]
    fn run_args_dri3_gpu() {
        let mut spec = spec();
        spec.gpu = Some(Gpu::Dri3 {
            device: "/dev/dri/renderD128".to_owned(),
        });
        let args = DockerRuntime::build_run_args(&spec);
        assert!(args.contains(&"/dev/dri/renderD128:/dev/dri/renderD128".to_owned()));
    }
}
