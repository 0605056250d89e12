//! Docker runner backend
//!
//! Drives the `docker` CLI: the guest layer is imported as an image, a
//! long-lived pod runs `sleep infinity`, pipeline steps run via
//! `docker exec`, and the workspace is exported as a gzip tar stream.

use crate::arch::Arch;
use crate::error::{ForgeError, ForgeResult};
use crate::guest::Layer;
use crate::orchestration::config::{ContainerConfig, DEFAULT_WORKSPACE_DIR};
use crate::orchestration::runner::{OciImageLoader, Runner};
use async_trait::async_trait;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Container runner using the Docker CLI
#[derive(Debug)]
pub struct DockerRunner {
    loader: DockerLoader,
}

impl DockerRunner {
    pub fn new() -> Self {
        Self {
            loader: DockerLoader,
        }
    }

    async fn exec(args: &[&str]) -> ForgeResult<std::process::Output> {
        debug!("executing: docker {:?}", args);

        Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ForgeError::command_failed(format!("docker {args:?}"), e))
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn test_usability(&self) -> bool {
        Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn temp_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }

    fn oci_image_loader(&self) -> Option<&dyn OciImageLoader> {
        Some(&self.loader)
    }

    async fn start_pod(&self, config: &mut ContainerConfig) -> ForgeResult<()> {
        let image = config
            .img_ref
            .as_deref()
            .ok_or_else(|| ForgeError::PodStart("no image reference bound".into()))?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--workdir".into(),
            DEFAULT_WORKSPACE_DIR.into(),
        ];

        if !config.capabilities.networking {
            args.push("--network".into());
            args.push("none".into());
        }

        for mount in &config.mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", mount.source, mount.destination));
        }
        for pair in config.env_pairs() {
            args.push("-e".into());
            args.push(pair);
        }
        if let Some(cpu) = &config.cpu {
            args.push("--cpus".into());
            args.push(cpu.clone());
        }
        if let Some(memory) = &config.memory {
            args.push("--memory".into());
            args.push(memory.clone());
        }

        args.push(image.to_string());
        args.extend(["sleep".into(), "infinity".into()]);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = Self::exec(&arg_refs).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForgeError::PodStart(stderr.trim().to_string()));
        }

        let pod_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("pod started: {}", &pod_id[..12.min(pod_id.len())]);
        config.pod_id = Some(pod_id);
        Ok(())
    }

    async fn terminate_pod(&self, config: &ContainerConfig) -> ForgeResult<()> {
        let pod_id = config
            .pod_id
            .as_deref()
            .ok_or_else(|| ForgeError::PodTerminate("no pod started".into()))?;

        let output = Self::exec(&["rm", "-f", pod_id]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ForgeError::PodTerminate(stderr.trim().to_string()))
        }
    }

    async fn run_cmd(&self, config: &ContainerConfig, command: &[String]) -> ForgeResult<()> {
        let pod_id = config
            .pod_id
            .as_deref()
            .ok_or_else(|| ForgeError::command_exec("docker exec", "no pod started"))?;

        let mut args: Vec<String> = vec![
            "exec".into(),
            "--workdir".into(),
            DEFAULT_WORKSPACE_DIR.into(),
            pod_id.into(),
        ];
        args.extend(command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        // The runner owns the container-level timeout; the orchestrator
        // enforces only the whole-build timeout.
        let output = match config.timeout {
            Some(limit) => tokio::time::timeout(limit, Self::exec(&arg_refs))
                .await
                .map_err(|_| ForgeError::Timeout { timeout: limit })??,
            None => Self::exec(&arg_refs).await?,
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ForgeError::command_exec(
                command.join(" "),
                stderr.trim().to_string(),
            ))
        }
    }

    async fn workspace_tar(
        &self,
        config: &ContainerConfig,
    ) -> ForgeResult<Option<Box<dyn Read + Send>>> {
        let pod_id = config
            .pod_id
            .as_deref()
            .ok_or_else(|| ForgeError::WorkspaceTar("no pod started".into()))?;

        let output = Self::exec(&[
            "exec",
            pod_id,
            "sh",
            "-c",
            &format!("cd {DEFAULT_WORKSPACE_DIR} && tar -czf - ./melange-out"),
        ])
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForgeError::WorkspaceTar(stderr.trim().to_string()));
        }

        Ok(Some(Box::new(Cursor::new(output.stdout))))
    }

    async fn close(&self) -> ForgeResult<()> {
        Ok(())
    }
}

/// Loads guest layers via `docker import`
#[derive(Debug)]
pub struct DockerLoader;

#[async_trait]
impl OciImageLoader for DockerLoader {
    async fn load_image(&self, layer: &Layer, arch: Arch) -> ForgeResult<String> {
        let short = layer
            .digest
            .strip_prefix("sha256:")
            .unwrap_or(&layer.digest);
        let image_ref = format!("apkforge-guest:{}", &short[..12.min(short.len())]);

        let path = layer.path.display().to_string();
        let platform = format!("linux/{}", arch.to_apk());
        let output = DockerRunner::exec(&[
            "import",
            "--platform",
            &platform,
            &path,
            &image_ref,
        ])
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForgeError::ImageLoad(stderr.trim().to_string()));
        }

        debug!("loaded {} as {}", layer.path.display(), image_ref);
        Ok(image_ref)
    }

    async fn remove_image(&self, image_ref: &str) -> ForgeResult<()> {
        let output = DockerRunner::exec(&["rmi", image_ref]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Removing an already-absent image is not a failure
            if stderr.contains("No such image") {
                Ok(())
            } else {
                Err(ForgeError::ImageLoad(stderr.trim().to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_name() {
        assert_eq!(DockerRunner::new().name(), "docker");
    }

    #[test]
    fn runner_has_loader() {
        assert!(DockerRunner::new().oci_image_loader().is_some());
    }
}
