//! Build orchestration
//!
//! `Build` owns the workspace, the guest directory, and the runner for
//! one package build on one architecture. Construction validates the
//! whole configuration; `build_package` drives the ordered phases.

pub mod cache;
mod package;
pub mod retrieve;
pub mod workspace;

use crate::arch::Arch;
use crate::error::{ForgeError, ForgeResult};
use crate::guest::{ApkoCli, GuestBuilder};
use crate::orchestration::config::{
    BindMount, Capabilities, ContainerConfig, DEFAULT_CACHE_DIR, DEFAULT_RESOLV_CONF_PATH,
    DEFAULT_WORKSPACE_DIR,
};
use crate::orchestration::{all_runners, Runner};
use crate::recipe::schema::{BuildOption, Recipe, Subpackage};
use crate::recipe::subst::Substitutions;
use crate::recipe::{cond, discover, parse};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Everything configurable about one build, before validation.
pub struct BuildSettings {
    /// Explicit recipe path; `None` probes the discovery order
    pub recipe_path: Option<PathBuf>,
    /// Target architecture; `None` builds for the host
    pub arch: Option<Arch>,
    pub source_dir: PathBuf,
    /// Explicit workspace root; `None` allocates a temporary one
    pub workspace_dir: Option<PathBuf>,
    pub guest_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub apk_cache_dir: Option<PathBuf>,
    pub cache_source: Option<String>,
    pub workspace_ignore: String,
    pub pipeline_dirs: Vec<PathBuf>,
    pub signing_key: Option<PathBuf>,
    pub signing_passphrase: String,
    pub namespace: Option<String>,
    pub source_date_epoch: i64,
    pub bin_sh_overlay: Option<PathBuf>,
    pub extra_keys: Vec<String>,
    pub extra_repos: Vec<String>,
    pub enabled_build_options: Vec<String>,
    /// Resume a prior multi-arch build: keep the workspace path as-is
    pub continue_label: Option<String>,
    pub strip_origin_name: bool,
    pub generate_index: bool,
    pub empty_workspace: bool,
    pub create_build_log: bool,
    pub fail_on_lint_warning: bool,
    pub debug: bool,
    pub debug_runner: bool,
    pub interactive: bool,
    pub remove: bool,
    pub default_cpu: Option<String>,
    pub default_memory: Option<String>,
    pub default_timeout: Option<Duration>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            recipe_path: None,
            arch: None,
            source_dir: PathBuf::from("."),
            workspace_dir: None,
            guest_dir: None,
            out_dir: PathBuf::from("./packages"),
            cache_dir: Some(PathBuf::from("./melange-cache")),
            apk_cache_dir: None,
            cache_source: None,
            workspace_ignore: ".melangeignore".to_string(),
            pipeline_dirs: Vec::new(),
            signing_key: None,
            signing_passphrase: String::new(),
            namespace: None,
            source_date_epoch: 0,
            bin_sh_overlay: None,
            extra_keys: Vec::new(),
            extra_repos: Vec::new(),
            enabled_build_options: Vec::new(),
            continue_label: None,
            strip_origin_name: false,
            generate_index: false,
            empty_workspace: false,
            create_build_log: false,
            fail_on_lint_warning: false,
            debug: false,
            debug_runner: false,
            interactive: false,
            remove: false,
            default_cpu: None,
            default_memory: None,
            default_timeout: None,
        }
    }
}

/// A validated build for one package on one architecture.
#[derive(Debug)]
pub struct Build {
    pub recipe: Recipe,
    pub recipe_path: PathBuf,
    pub arch: Arch,
    pub source_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub guest_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub apk_cache_dir: Option<PathBuf>,
    pub cache_source: Option<String>,
    pub workspace_ignore: String,
    pub pipeline_dirs: Vec<PathBuf>,
    pub signing_key: Option<PathBuf>,
    pub signing_passphrase: String,
    pub namespace: Option<String>,
    pub source_date_epoch: i64,
    pub bin_sh_overlay: Option<PathBuf>,
    pub extra_keys: Vec<String>,
    pub extra_repos: Vec<String>,
    pub strip_origin_name: bool,
    pub generate_index: bool,
    pub empty_workspace: bool,
    pub create_build_log: bool,
    pub fail_on_lint_warning: bool,
    pub debug: bool,
    pub debug_runner: bool,
    pub interactive: bool,
    pub remove: bool,
    pub default_cpu: Option<String>,
    pub default_memory: Option<String>,
    pub default_timeout: Option<Duration>,

    pub(crate) runner: Box<dyn Runner>,
    pub(crate) guest_builder: Box<dyn GuestBuilder>,
    pub(crate) container_config: Option<ContainerConfig>,
    /// Per-subpackage `if` verdicts, evaluated once per build
    pub(crate) should_run_memo: HashMap<String, bool>,
}

impl Build {
    /// Validate settings into a build.
    ///
    /// Returns `ForgeError::SkipThisArch` when the recipe's explicit
    /// target list does not contain the current architecture; callers
    /// treat that non-fatally.
    pub async fn new(settings: BuildSettings, runner: Box<dyn Runner>) -> ForgeResult<Self> {
        Self::with_guest_builder(settings, runner, Box::new(ApkoCli)).await
    }

    pub async fn with_guest_builder(
        settings: BuildSettings,
        runner: Box<dyn Runner>,
        guest_builder: Box<dyn GuestBuilder>,
    ) -> ForgeResult<Self> {
        let arch = settings.arch.unwrap_or_else(Arch::host);

        // Resolve the workspace: explicit roots get a per-arch subdir
        // (unless resuming) and must be absolute for bind mounts.
        let workspace_dir = match &settings.workspace_dir {
            Some(dir) => {
                let dir = if settings.continue_label.is_none() {
                    dir.join(arch.to_apk())
                } else {
                    dir.clone()
                };
                std::path::absolute(&dir)
                    .map_err(|e| ForgeError::io(format!("unable to resolve path {}", dir.display()), e))?
            }
            None => tempfile::Builder::new()
                .prefix("apkforge-workspace-")
                .tempdir_in(runner.temp_dir())
                .map_err(|e| ForgeError::io("unable to create workspace dir", e))?
                .keep(),
        };

        let recipe_path = discover(settings.recipe_path.as_deref())?;
        let recipe = parse(&recipe_path)?;

        let targets = &recipe.package.target_architecture;
        if targets.len() == 1 && targets[0] == "all" {
            warn!("target-architecture: ['all'] is deprecated and will become an error; remove this field to build for all available archs");
        } else if !targets.is_empty() && !targets.iter().any(|t| t == arch.to_apk()) {
            return Err(ForgeError::SkipThisArch);
        }

        // The environment always wins over the configured epoch.
        let source_date_epoch = match std::env::var("SOURCE_DATE_EPOCH") {
            Ok(value) => value
                .trim()
                .parse::<i64>()
                .map_err(|e| ForgeError::InvalidSourceDateEpoch {
                    value,
                    reason: e.to_string(),
                })?,
            Err(_) => settings.source_date_epoch,
        };

        if !runner.test_usability().await {
            return Err(ForgeError::RunnerUnusable {
                name: runner.name().to_string(),
                available: all_runners().join(", "),
            });
        }

        let mut build = Self {
            recipe,
            recipe_path,
            arch,
            source_dir: settings.source_dir,
            workspace_dir,
            guest_dir: settings.guest_dir,
            out_dir: settings.out_dir,
            cache_dir: settings.cache_dir,
            apk_cache_dir: settings.apk_cache_dir,
            cache_source: settings.cache_source,
            workspace_ignore: settings.workspace_ignore,
            pipeline_dirs: settings.pipeline_dirs,
            signing_key: settings.signing_key,
            signing_passphrase: settings.signing_passphrase,
            namespace: settings.namespace,
            source_date_epoch,
            bin_sh_overlay: settings.bin_sh_overlay,
            extra_keys: settings.extra_keys,
            extra_repos: settings.extra_repos,
            strip_origin_name: settings.strip_origin_name,
            generate_index: settings.generate_index,
            empty_workspace: settings.empty_workspace,
            create_build_log: settings.create_build_log,
            fail_on_lint_warning: settings.fail_on_lint_warning,
            debug: settings.debug,
            debug_runner: settings.debug_runner,
            interactive: settings.interactive,
            remove: settings.remove,
            default_cpu: settings.default_cpu,
            default_memory: settings.default_memory,
            default_timeout: settings.default_timeout,
            runner,
            guest_builder,
            container_config: None,
            should_run_memo: HashMap::new(),
        };

        for name in &settings.enabled_build_options {
            info!("applying configuration patches for build option {name}");
            if let Some(option) = build.recipe.options.get(name).cloned() {
                apply_build_option(&mut build.recipe, &option);
            }
        }

        Ok(build)
    }

    /// Whether this build runs no container at all.
    ///
    /// An empty top-level pipeline means build-less even when
    /// subpackages declare pipelines; those are gated out.
    pub fn is_build_less(&self) -> bool {
        self.recipe.pipeline.is_empty()
    }

    /// Emit a human-readable configuration summary
    pub fn summarize(&self) {
        info!("apkforge is building:");
        info!("  recipe file: {}", self.recipe_path.display());
        self.summarize_paths();
    }

    pub fn summarize_paths(&self) {
        info!("  workspace dir: {}", self.workspace_dir.display());
        if let Some(guest) = &self.guest_dir {
            info!("  guest dir: {}", guest.display());
        }
    }

    /// `"gnu"` when the guest carries glibc, `"musl"` otherwise
    pub fn build_flavor(&self) -> &'static str {
        if let Some(guest) = &self.guest_dir {
            for dir in ["lib", "lib64"] {
                if guest.join(dir).join("libc.so.6").is_file() {
                    return "gnu";
                }
            }
        }
        "musl"
    }

    /// GNU autoconf build triplet for this build
    pub fn build_triplet_gnu(&self) -> String {
        self.arch.to_triplet_gnu(self.build_flavor())
    }

    /// Rust/Cargo build triplet for this build
    pub fn build_triplet_rust(&self) -> String {
        self.arch.to_triplet_rust(self.build_flavor())
    }

    /// Substitution scope for the main package
    pub(crate) fn substitutions(&self) -> Substitutions {
        Substitutions::new(
            &self.recipe.package,
            &self.recipe.vars,
            self.arch,
            &self.build_triplet_gnu(),
            &self.build_triplet_rust(),
        )
    }

    /// Evaluate every subpackage's `if` once and memoize; the same
    /// verdict is used by pipeline, lint, SBOM, emit, and index.
    pub(crate) fn evaluate_subpackage_conditions(&mut self) -> ForgeResult<()> {
        let subs = self.substitutions();
        for sp in &self.recipe.subpackages {
            let verdict = match &sp.if_expr {
                None => true,
                Some(expr) => {
                    let scoped = subs.for_subpackage(sp);
                    cond::evaluate(expr, |key| Ok(scoped.lookup(key)))?
                }
            };
            self.should_run_memo.insert(sp.name.clone(), verdict);
        }
        Ok(())
    }

    /// The memoized `if` verdict for a subpackage
    pub(crate) fn should_run(&self, sp: &Subpackage) -> bool {
        self.should_run_memo.get(&sp.name).copied().unwrap_or(true)
    }

    /// Replace `{guest}/bin/sh` with the configured overlay binary.
    pub(crate) fn overlay_bin_sh(&self) -> ForgeResult<()> {
        let Some(overlay) = &self.bin_sh_overlay else {
            return Ok(());
        };
        let guest = self
            .guest_dir
            .as_deref()
            .expect("guest dir exists on the container path");
        let target = guest.join("bin/sh");

        // Unlink first: the target may be a symlink and a plain copy
        // would write through it.
        std::fs::remove_file(&target)
            .map_err(|e| ForgeError::io("copying overlay /bin/sh", e))?;
        std::fs::copy(overlay, &target).map_err(|e| ForgeError::io("copying overlay /bin/sh", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| ForgeError::io("setting overlay /bin/sh executable", e))?;
        }

        Ok(())
    }

    /// Assemble (once) and return the container configuration.
    pub(crate) fn workspace_config(&mut self) -> &ContainerConfig {
        if self.container_config.is_none() {
            self.container_config = Some(self.assemble_container_config());
        }
        self.container_config.as_ref().expect("just assembled")
    }

    fn assemble_container_config(&self) -> ContainerConfig {
        if self.is_build_less() {
            return ContainerConfig {
                arch: Some(self.arch),
                ..Default::default()
            };
        }

        let mut mounts = vec![
            BindMount {
                source: self.workspace_dir.display().to_string(),
                destination: DEFAULT_WORKSPACE_DIR.to_string(),
            },
            BindMount {
                source: "/etc/resolv.conf".to_string(),
                destination: DEFAULT_RESOLV_CONF_PATH.to_string(),
            },
        ];

        if let Some(cache_dir) = &self.cache_dir {
            if cache_dir.is_dir() {
                let source = match std::fs::canonicalize(cache_dir) {
                    Ok(real) => real,
                    Err(e) => {
                        info!("could not resolve path for --cache-dir: {e}");
                        cache_dir.clone()
                    }
                };
                mounts.push(BindMount {
                    source: source.display().to_string(),
                    destination: DEFAULT_CACHE_DIR.to_string(),
                });
            } else {
                info!("--cache-dir {} not a dir; skipping", cache_dir.display());
            }
        }

        let mut environment = HashMap::new();
        environment.insert(
            "SOURCE_DATE_EPOCH".to_string(),
            self.source_date_epoch.to_string(),
        );
        for (k, v) in &self.recipe.environment.environment {
            environment.insert(k.clone(), v.clone());
        }

        let (cpu, memory) = match &self.recipe.package.resources {
            Some(resources) => (
                resources.cpu.clone().or_else(|| self.default_cpu.clone()),
                resources.memory.clone().or_else(|| self.default_memory.clone()),
            ),
            None => (self.default_cpu.clone(), self.default_memory.clone()),
        };

        let timeout = match self.recipe.package.timeout {
            0 => self.default_timeout,
            secs => Some(Duration::from_secs(secs)),
        };

        ContainerConfig {
            arch: Some(self.arch),
            package_name: self.recipe.package.name.clone(),
            mounts,
            // TODO(needs-derivation): derive from pipeline requirements
            capabilities: Capabilities { networking: true },
            environment,
            cpu,
            memory,
            timeout,
            img_ref: None,
            pod_id: None,
        }
    }

    /// Release everything this build owns. With `remove` policy set,
    /// the guest dir, workspace dir, and loaded image are deleted too.
    /// Failures are joined so partial teardown is fully reported.
    pub async fn close(&mut self) -> ForgeResult<()> {
        let mut results = Vec::new();

        if self.remove {
            if let Some(guest) = &self.guest_dir {
                info!("deleting guest dir {}", guest.display());
                results.push(remove_tree(guest));
            }
            results.push(remove_tree(&self.workspace_dir));

            if let Some(img_ref) = self
                .container_config
                .as_ref()
                .and_then(|c| c.img_ref.as_deref())
            {
                match self.runner.oci_image_loader() {
                    Some(loader) => results.push(loader.remove_image(img_ref).await),
                    None => {}
                }
            }
        }

        results.push(self.runner.close().await);
        ForgeError::join(results)
    }
}

fn remove_tree(path: &Path) -> ForgeResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ForgeError::io(format!("removing {}", path.display()), e)),
    }
}

/// Apply one enabled build option: merge variables, append added
/// packages, remove removed packages by swap-with-last-and-truncate.
pub fn apply_build_option(recipe: &mut Recipe, option: &BuildOption) {
    for (k, v) in &option.vars {
        recipe.vars.insert(k.clone(), v.clone());
    }

    let patch = &option.environment.contents.packages;
    recipe
        .environment
        .contents
        .packages
        .extend(patch.add.iter().cloned());

    for pkg in &patch.remove {
        let list = &mut recipe.environment.contents.packages;
        let scan_len = list.len();
        let mut len = scan_len;
        for pos in 0..scan_len {
            if list[pos] == *pkg && pos < len {
                list[pos] = list[len - 1].clone();
                len -= 1;
            }
        }
        list.truncate(len);
    }
}
