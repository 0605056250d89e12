//! Runner abstraction
//!
//! Provides traits for container execution that can be implemented by
//! different backends (bubblewrap on bare Linux, Docker elsewhere).

use crate::arch::Arch;
use crate::error::ForgeResult;
use crate::guest::Layer;
use crate::orchestration::config::ContainerConfig;
use async_trait::async_trait;
use std::io::Read;
use std::path::PathBuf;

/// Abstract container runner interface consumed by the orchestrator
#[async_trait]
pub trait Runner: Send + Sync + std::fmt::Debug {
    /// Human-readable runner name
    fn name(&self) -> &'static str;

    /// Check whether this runner can actually run containers here
    async fn test_usability(&self) -> bool;

    /// Root directory for runner-owned temporary state
    fn temp_dir(&self) -> PathBuf;

    /// OCI image loader, if this runner needs images loaded
    fn oci_image_loader(&self) -> Option<&dyn OciImageLoader>;

    /// Start the build pod; records the pod ID on the config
    async fn start_pod(&self, config: &mut ContainerConfig) -> ForgeResult<()>;

    /// Terminate the build pod
    async fn terminate_pod(&self, config: &ContainerConfig) -> ForgeResult<()>;

    /// Execute a command inside the running pod
    async fn run_cmd(&self, config: &ContainerConfig, command: &[String]) -> ForgeResult<()>;

    /// Retrieve the post-build workspace as a gzip-compressed tar stream
    /// rooted at `./melange-out`. `None` means there is nothing to
    /// retrieve (the runner operated on the workspace directly).
    async fn workspace_tar(
        &self,
        config: &ContainerConfig,
    ) -> ForgeResult<Option<Box<dyn Read + Send>>>;

    /// Release any resources held by the runner
    async fn close(&self) -> ForgeResult<()>;
}

/// Loads OCI image layers into a runner's image store
#[async_trait]
pub trait OciImageLoader: Send + Sync {
    /// Load a single-layer image; returns the reference the runner will
    /// accept as `ContainerConfig::img_ref`
    async fn load_image(&self, layer: &Layer, arch: Arch) -> ForgeResult<String>;

    /// Remove a previously loaded image
    async fn remove_image(&self, image_ref: &str) -> ForgeResult<()>;
}
