//! Bubblewrap runner backend
//!
//! Runs each pipeline step in a fresh `bwrap` sandbox rooted at the
//! unpacked guest tree. There is no persistent pod and the workspace is
//! bind-mounted read-write, so there is nothing to retrieve afterwards
//! (`workspace_tar` returns `None`).

use crate::arch::Arch;
use crate::error::{ForgeError, ForgeResult};
use crate::guest::Layer;
use crate::orchestration::config::{ContainerConfig, DEFAULT_WORKSPACE_DIR};
use crate::orchestration::runner::{OciImageLoader, Runner};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Container runner using bubblewrap sandboxes
#[derive(Debug)]
pub struct BubblewrapRunner {
    loader: BubblewrapLoader,
}

impl BubblewrapRunner {
    pub fn new() -> Self {
        Self {
            loader: BubblewrapLoader,
        }
    }
}

impl Default for BubblewrapRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for BubblewrapRunner {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    async fn test_usability(&self) -> bool {
        Command::new("bwrap")
            .arg("--version")
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
        if config.img_ref.is_none() {
            return Err(ForgeError::PodStart("no image reference bound".into()));
        }

        // No long-lived process; each step gets its own sandbox.
        config.pod_id = Some(format!("bwrap-{}", config.package_name));
        Ok(())
    }

    async fn terminate_pod(&self, _config: &ContainerConfig) -> ForgeResult<()> {
        Ok(())
    }

    async fn run_cmd(&self, config: &ContainerConfig, command: &[String]) -> ForgeResult<()> {
        let root = config
            .img_ref
            .as_deref()
            .ok_or_else(|| ForgeError::command_exec("bwrap", "no image reference bound"))?;

        let mut args: Vec<String> = vec![
            "--bind".into(),
            root.into(),
            "/".into(),
            "--dev".into(),
            "/dev".into(),
            "--proc".into(),
            "/proc".into(),
            "--chdir".into(),
            DEFAULT_WORKSPACE_DIR.into(),
        ];

        if !config.capabilities.networking {
            args.push("--unshare-net".into());
        }

        for mount in &config.mounts {
            args.push("--bind".into());
            args.push(mount.source.clone());
            args.push(mount.destination.clone());
        }
        for pair in config.env_pairs() {
            let (k, v) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
            args.push("--setenv".into());
            args.push(k.into());
            args.push(v.into());
        }

        args.extend(command.iter().cloned());

        debug!("executing: bwrap {:?}", args);

        let mut cmd = Command::new("bwrap");
        cmd.args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());

        let output = match config.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| ForgeError::Timeout { timeout: limit })?,
            None => cmd.output().await,
        }
        .map_err(|e| ForgeError::command_failed("bwrap", e))?;

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
        _config: &ContainerConfig,
    ) -> ForgeResult<Option<Box<dyn Read + Send>>> {
        // The workspace is bind-mounted read-write; nothing to retrieve.
        Ok(None)
    }

    async fn close(&self) -> ForgeResult<()> {
        Ok(())
    }
}

/// "Loads" a layer by unpacking it to a root directory; the returned
/// reference is the directory path bwrap binds as `/`.
#[derive(Debug)]
pub struct BubblewrapLoader;

#[async_trait]
impl OciImageLoader for BubblewrapLoader {
    async fn load_image(&self, layer: &Layer, _arch: Arch) -> ForgeResult<String> {
        let short = layer
            .digest
            .strip_prefix("sha256:")
            .unwrap_or(&layer.digest);
        let root = std::env::temp_dir().join(format!(
            "apkforge-root-{}",
            &short[..12.min(short.len())]
        ));

        std::fs::create_dir_all(&root)
            .map_err(|e| ForgeError::io(format!("mkdir -p {}", root.display()), e))?;

        let file = std::fs::File::open(&layer.path)
            .map_err(|e| ForgeError::io("opening layer", e))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);
        archive
            .unpack(&root)
            .map_err(|e| ForgeError::ImageLoad(e.to_string()))?;

        Ok(root.display().to_string())
    }

    async fn remove_image(&self, image_ref: &str) -> ForgeResult<()> {
        std::fs::remove_dir_all(image_ref)
            .map_err(|e| ForgeError::io(format!("removing root {image_ref}"), e))
    }
}
