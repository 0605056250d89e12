//! Recipe schema
//!
//! A recipe is a YAML document naming the package, its subpackages, the
//! build environment, and an ordered pipeline of build steps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root recipe structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipe {
    /// Package metadata
    pub package: Package,

    /// Build environment specification
    pub environment: ImageConfiguration,

    /// Named variables usable in substitutions
    pub vars: HashMap<String, String>,

    /// Named build options that patch the recipe when enabled
    pub options: HashMap<String, BuildOption>,

    /// Top-level build pipeline (ordered)
    pub pipeline: Vec<Pipeline>,

    /// Subpackages produced from the same build
    pub subpackages: Vec<Subpackage>,
}

/// Package metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Package {
    /// Package name
    pub name: String,

    /// Upstream version
    pub version: String,

    /// Package epoch (release counter)
    pub epoch: u64,

    /// Human-readable description
    pub description: Option<String>,

    /// Copyright / license blocks
    pub copyright: Vec<Copyright>,

    /// Runtime dependency declarations
    pub dependencies: Dependencies,

    /// Architectures this package builds for; empty means all
    pub target_architecture: Vec<String>,

    /// Resource requests for the build container
    pub resources: Option<Resources>,

    /// Whole-build timeout in seconds (0 = none)
    pub timeout: u64,

    /// Linter checks configuration
    pub checks: Checks,
}

impl Package {
    /// The versioned release string, e.g. `1.2.3-r0`
    pub fn full_version(&self) -> String {
        format!("{}-r{}", self.version, self.epoch)
    }

    /// SPDX-style license expression joined from the copyright blocks
    pub fn license_expression(&self) -> String {
        let licenses: Vec<&str> = self
            .copyright
            .iter()
            .map(|c| c.license.as_str())
            .filter(|l| !l.is_empty())
            .collect();
        licenses.join(" AND ")
    }

    /// All copyright attestations, newline-joined
    pub fn full_copyright(&self) -> String {
        self.copyright
            .iter()
            .filter_map(|c| c.attestation.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A copyright block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Copyright {
    /// Paths this block covers
    pub paths: Vec<String>,

    /// Copyright attestation text
    pub attestation: Option<String>,

    /// SPDX license identifier
    pub license: String,
}

/// Runtime dependency declarations for the emitted package
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Dependencies {
    /// Packages required at runtime
    pub runtime: Vec<String>,

    /// Virtuals this package provides
    pub provides: Vec<String>,
}

/// Resource requests forwarded to the runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Linter checks configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Checks {
    /// Additional linters to enable
    pub enabled: Vec<String>,

    /// Default linters to disable
    pub disabled: Vec<String>,
}

impl Checks {
    /// Resolve the linter set: defaults plus enabled minus disabled
    pub fn get_linters(&self) -> Vec<String> {
        let mut linters: Vec<String> = crate::lint::DEFAULT_LINTERS
            .iter()
            .map(|s| s.to_string())
            .collect();

        for lint in &self.enabled {
            if !linters.contains(lint) {
                linters.push(lint.clone());
            }
        }

        linters.retain(|l| !self.disabled.contains(l));
        linters
    }
}

/// Guest image configuration (base contents plus environment variables)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfiguration {
    pub contents: ImageContents,

    /// Environment variables exported into the build container
    pub environment: HashMap<String, String>,
}

/// Base contents of the guest image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageContents {
    /// APK repositories consulted while building the guest
    pub repositories: Vec<String>,

    /// Trusted signing keys
    pub keyring: Vec<String>,

    /// Packages installed into the guest
    pub packages: Vec<String>,
}

/// A named build option that patches the recipe when enabled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOption {
    /// Variables merged into the recipe's variables
    pub vars: HashMap<String, String>,

    /// Environment patch
    pub environment: OptionEnvironment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionEnvironment {
    pub contents: OptionContents,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionContents {
    pub packages: PackageListPatch,
}

/// Additions and removals against the environment package list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageListPatch {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// A single pipeline step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Pipeline {
    /// Optional display name
    pub name: Option<String>,

    /// Named pipeline to splice in from the pipeline search directories
    pub uses: Option<String>,

    /// Inputs passed to a `uses` pipeline
    pub with: HashMap<String, String>,

    /// Shell fragment executed in the build container
    pub runs: Option<String>,

    /// Conditional gating this step
    #[serde(rename = "if")]
    pub if_expr: Option<String>,

    /// Build-time packages this step requires
    pub needs: Option<Needs>,

    /// Working directory override for this step
    pub working_directory: Option<String>,

    /// Extra environment for this step
    pub environment: HashMap<String, String>,

    /// Input declarations (only meaningful in `uses` pipeline definitions)
    pub inputs: HashMap<String, Input>,

    /// Nested steps
    pub pipeline: Vec<Pipeline>,
}

/// Packages a pipeline step needs in the build environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Needs {
    pub packages: Vec<String>,
}

/// An input declaration in a `uses` pipeline definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Input {
    pub description: Option<String>,
    pub default: Option<String>,
    pub required: bool,
}

/// A subpackage produced from the same build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Subpackage {
    /// Subpackage name
    pub name: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Conditional gating the whole subpackage
    #[serde(rename = "if")]
    pub if_expr: Option<String>,

    /// Runtime dependency declarations
    pub dependencies: Dependencies,

    /// Subpackage pipeline
    pub pipeline: Vec<Pipeline>,

    /// Linter checks configuration
    pub checks: Checks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_deserializes_minimal() {
        let yaml = r#"
package:
  name: lib
  version: "1.0"
"#;
        let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(recipe.package.name, "lib");
        assert_eq!(recipe.package.epoch, 0);
        assert!(recipe.pipeline.is_empty());
    }

    #[test]
    fn full_version_includes_epoch() {
        let pkg = Package {
            name: "lib".into(),
            version: "1.0".into(),
            epoch: 3,
            ..Default::default()
        };
        assert_eq!(pkg.full_version(), "1.0-r3");
    }

    #[test]
    fn license_expression_joins_blocks() {
        let pkg = Package {
            copyright: vec![
                Copyright {
                    license: "MIT".into(),
                    ..Default::default()
                },
                Copyright {
                    license: "Apache-2.0".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(pkg.license_expression(), "MIT AND Apache-2.0");
    }

    #[test]
    fn target_architecture_kebab_case() {
        let yaml = r#"
package:
  name: lib
  version: "1.0"
  target-architecture:
    - aarch64
"#;
        let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(recipe.package.target_architecture, vec!["aarch64"]);
    }

    #[test]
    fn pipeline_if_and_needs() {
        let yaml = r#"
package:
  name: lib
  version: "1.0"
pipeline:
  - uses: fetch
    with:
      uri: https://example.com/lib-1.0.tar.gz
      expected-sha256: abc123
  - runs: make install
    if: ${{vars.build-docs}} == 'true'
    needs:
      packages:
        - busybox
"#;
        let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(recipe.pipeline.len(), 2);
        assert_eq!(recipe.pipeline[0].uses.as_deref(), Some("fetch"));
        assert_eq!(
            recipe.pipeline[1].needs.as_ref().unwrap().packages,
            vec!["busybox"]
        );
        assert!(recipe.pipeline[1].if_expr.is_some());
    }

    #[test]
    fn checks_resolution() {
        let checks = Checks {
            enabled: vec!["usrlocal".into()],
            disabled: vec!["empty".into()],
        };
        let linters = checks.get_linters();
        assert!(linters.contains(&"usrlocal".to_string()));
        assert!(!linters.contains(&"empty".to_string()));
    }
}
