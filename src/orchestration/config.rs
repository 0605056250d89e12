//! Container configuration shared by all runner backends

use crate::arch::Arch;
use std::collections::HashMap;
use std::time::Duration;

/// Workspace bind-mount target inside the build container
pub const DEFAULT_WORKSPACE_DIR: &str = "/home/build";

/// resolv.conf bind-mount target inside the build container
pub const DEFAULT_RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Cache bind-mount target inside the build container
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/melange";

/// A host-to-container bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub destination: String,
}

/// Capabilities granted to the build container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub networking: bool,
}

/// Container configuration for a package build pod
///
/// Assembled once per build and memoized; the image reference is bound
/// after the guest is built and the pod ID after the pod starts.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Target architecture
    pub arch: Option<Arch>,

    /// Package being built (used for pod naming)
    pub package_name: String,

    /// Bind mounts
    pub mounts: Vec<BindMount>,

    /// Granted capabilities
    pub capabilities: Capabilities,

    /// Environment variables (always includes SOURCE_DATE_EPOCH)
    pub environment: HashMap<String, String>,

    /// CPU request forwarded to the runner
    pub cpu: Option<String>,

    /// Memory request forwarded to the runner
    pub memory: Option<String>,

    /// Container-level timeout forwarded to the runner
    pub timeout: Option<Duration>,

    /// Image reference, populated after the guest is built and loaded
    pub img_ref: Option<String>,

    /// Pod ID, populated after the pod starts
    pub pod_id: Option<String>,
}

impl ContainerConfig {
    /// Render environment entries as `KEY=VALUE` pairs in sorted order
    pub fn env_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        assert_eq!(DEFAULT_WORKSPACE_DIR, "/home/build");
        assert_eq!(DEFAULT_RESOLV_CONF_PATH, "/etc/resolv.conf");
        assert_eq!(DEFAULT_CACHE_DIR, "/var/cache/melange");
    }

    #[test]
    fn env_pairs_sorted() {
        let mut config = ContainerConfig::default();
        config.environment.insert("B".into(), "2".into());
        config.environment.insert("A".into(), "1".into());

        assert_eq!(config.env_pairs(), vec!["A=1", "B=2"]);
    }

    #[test]
    fn late_bound_fields_start_unset() {
        let config = ContainerConfig::default();
        assert!(config.img_ref.is_none());
        assert!(config.pod_id.is_none());
    }
}
