//! The ordered build phases
//!
//! `build_package` drives: needs scan, workspace population, guest
//! build, cache population, pod lifecycle, pipelines, workspace
//! retrieval, lint, SBOM, emit, cleanup, and indexing. Pod teardown is
//! guaranteed on every exit path, including timeout cancellation.

use super::{cache, retrieve, workspace, Build};
use crate::apk::{emit_package, generate_index, write_json_index, EmitSpec, IndexOptions};
use crate::error::{ForgeError, ForgeResult};
use crate::guest::GuestSpec;
use crate::lint;
use crate::pipeline::PipelineContext;
use crate::recipe::schema::{Checks, Pipeline};
use crate::sbom;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A (sub)package queued for linting
struct LinterTarget {
    name: String,
    checks: Checks,
}

impl Build {
    /// Run the whole build. On success every in-scope (sub)package has
    /// a signed archive under `{out_dir}/{arch}/`, plus the signed
    /// index when requested.
    pub async fn build_package(&mut self) -> ForgeResult<()> {
        self.summarize();

        let result = match self.recipe.package.timeout {
            0 => self.run_phases().await,
            secs => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, self.run_phases()).await {
                    Ok(result) => result,
                    Err(_) => Err(ForgeError::Timeout { timeout: limit }),
                }
            }
        };

        // Teardown runs on every exit path, a timed-out build included.
        // Skipped only when the runner is being debugged.
        if !self.debug_runner {
            if let Some(config) = &self.container_config {
                if config.pod_id.is_some() {
                    if let Err(e) = self.runner.terminate_pod(config).await {
                        warn!("unable to terminate pod: {e}");
                    }
                }
            }
        }

        result
    }

    async fn run_phases(&mut self) -> ForgeResult<()> {
        // Guest dir provisioning; a guest exists iff the build runs a
        // container.
        if !self.is_build_less() && self.guest_dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("apkforge-guest-")
                .tempdir_in(self.runner.temp_dir())
                .map_err(|e| ForgeError::io("unable to make guest directory", e))?
                .keep();
            self.guest_dir = Some(dir);
        }

        // Pipeline needs scan. Runs even for build-less configurations
        // so environment requirements still accumulate.
        info!("evaluating pipelines for package requirements");
        {
            let mut env = self.recipe.environment.clone();
            for step in &self.recipe.pipeline {
                PipelineContext::new(step, None, &self.pipeline_dirs).apply_needs(&mut env)?;
            }
            for sp in &self.recipe.subpackages {
                for step in &sp.pipeline {
                    PipelineContext::new(step, None, &self.pipeline_dirs).apply_needs(&mut env)?;
                }
            }
            self.recipe.environment = env;
        }

        // Workspace materialization
        if self.empty_workspace {
            info!("empty workspace requested");
        } else {
            std::fs::create_dir_all(&self.workspace_dir).map_err(|e| {
                ForgeError::io(format!("mkdir -p {}", self.workspace_dir.display()), e)
            })?;
            info!(
                "populating workspace {} from {}",
                self.workspace_dir.display(),
                self.source_dir.display()
            );
            workspace::populate_workspace(
                &self.source_dir,
                &self.workspace_dir,
                &self.workspace_ignore,
            )?;
        }

        // Workspace sub-tree seed
        let main_out = self
            .workspace_dir
            .join("melange-out")
            .join(&self.recipe.package.name);
        std::fs::create_dir_all(&main_out)
            .map_err(|e| ForgeError::io(format!("mkdir -p {}", main_out.display()), e))?;

        let mut linter_queue: Vec<LinterTarget> = Vec::new();
        self.workspace_config();

        if !self.is_build_less() {
            let guest_dir = self.guest_dir.clone().expect("guest dir provisioned above");
            std::fs::create_dir_all(&guest_dir)
                .map_err(|e| ForgeError::io(format!("mkdir -p {}", guest_dir.display()), e))?;

            info!("building guest environment in {}", guest_dir.display());
            let spec = GuestSpec {
                environment: self.recipe.environment.clone(),
                arch: self.arch,
                extra_keys: self.extra_keys.clone(),
                extra_repos: self.extra_repos.clone(),
                apk_cache_dir: self.apk_cache_dir.clone(),
            };
            self.guest_builder.build_layout(&spec, &guest_dir).await?;

            let layer = crate::guest::layout_to_layer(&guest_dir, self.source_date_epoch)?;
            let loader = self
                .runner
                .oci_image_loader()
                .ok_or_else(|| ForgeError::OciLoaderUnsupported(self.runner.name().to_string()))?;
            let img_ref = loader.load_image(&layer, self.arch).await?;
            let _ = std::fs::remove_file(&layer.path);

            info!("img ref = {img_ref}");
            self.container_config
                .as_mut()
                .expect("container config is memoized")
                .img_ref = Some(img_ref);

            self.overlay_bin_sh()?;

            if let (Some(cache_dir), Some(source)) = (&self.cache_dir, &self.cache_source) {
                cache::populate_cache(cache_dir, source, &self.recipe).await?;
            }

            let config = self
                .container_config
                .as_mut()
                .expect("container config is memoized");
            self.runner.start_pod(config).await?;

            // Run the main pipeline
            debug!("running the main pipeline");
            let subs = self.substitutions();
            let config = self
                .container_config
                .as_ref()
                .expect("container config is memoized");
            for (idx, step) in self.recipe.pipeline.iter().enumerate() {
                PipelineContext::new(step, Some(config), &self.pipeline_dirs)
                    .run(&*self.runner, &subs)
                    .await?;
                if self.create_build_log {
                    append_build_log(&self.workspace_dir, idx, step)?;
                }
            }

            linter_queue.push(LinterTarget {
                name: self.recipe.package.name.clone(),
                checks: self.recipe.package.checks.clone(),
            });
        }

        // One `if` verdict per subpackage, shared by pipeline, lint,
        // SBOM, emit, and index.
        self.evaluate_subpackage_conditions()?;

        // Subpackage pipelines, in declared order
        let subs = self.substitutions();
        for sp in &self.recipe.subpackages {
            if !self.should_run(sp) {
                continue;
            }

            if !self.is_build_less() {
                info!("running pipeline for subpackage {}", sp.name);
                let scoped = subs.for_subpackage(sp);
                let config = self
                    .container_config
                    .as_ref()
                    .expect("container config is memoized");
                for step in &sp.pipeline {
                    PipelineContext::new(step, Some(config), &self.pipeline_dirs)
                        .run(&*self.runner, &scoped)
                        .await?;
                }

                linter_queue.push(LinterTarget {
                    name: sp.name.clone(),
                    checks: sp.checks.clone(),
                });
            }

            let sub_out = self.workspace_dir.join("melange-out").join(&sp.name);
            std::fs::create_dir_all(&sub_out)
                .map_err(|e| ForgeError::io(format!("mkdir -p {}", sub_out.display()), e))?;
        }

        // Workspace retrieval
        if !self.is_build_less() {
            let config = self
                .container_config
                .as_ref()
                .expect("container config is memoized");
            info!(
                "retrieving workspace from builder: {}",
                config.pod_id.as_deref().unwrap_or("(none)")
            );
            if let Some(reader) = self.runner.workspace_tar(config).await? {
                retrieve::retrieve_workspace(reader, &self.workspace_dir)?;
                info!(
                    "retrieved and wrote post-build workspace to: {}",
                    self.workspace_dir.display()
                );
            }
        }

        // Linting
        let strict = self.fail_on_lint_warning;
        for target in &linter_queue {
            info!("running package linters for {}", target.name);

            let path = self.workspace_dir.join("melange-out").join(&target.name);
            let linters = target.checks.get_linters();

            let mut pending: Option<String> = None;
            lint::lint_build(&target.name, &path, &linters, |issue| {
                if strict {
                    if pending.is_none() {
                        pending = Some(issue.to_string());
                    }
                } else {
                    warn!("WARNING: {issue}");
                }
            })?;

            if let Some(issue) = pending {
                return Err(ForgeError::LintWarning(issue));
            }
        }

        // SBOM generation
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let generator = sbom::Generator::new(self.source_date_epoch);

        for sp in &self.recipe.subpackages {
            if !self.should_run(sp) {
                continue;
            }
            info!("generating SBOM for subpackage {}", sp.name);
            generator.generate(&sbom::Spec {
                path: self.workspace_dir.join("melange-out").join(&sp.name),
                package_name: sp.name.clone(),
                package_version: self.recipe.package.full_version(),
                license: self.recipe.package.license_expression(),
                copyright: self.recipe.package.full_copyright(),
                namespace: namespace.clone(),
                arch: self.arch.to_apk().to_string(),
            })?;
        }

        generator.generate(&sbom::Spec {
            path: self
                .workspace_dir
                .join("melange-out")
                .join(&self.recipe.package.name),
            package_name: self.recipe.package.name.clone(),
            package_version: self.recipe.package.full_version(),
            license: self.recipe.package.license_expression(),
            copyright: self.recipe.package.full_copyright(),
            namespace,
            arch: self.arch.to_apk().to_string(),
        })?;

        // Emit main package, then each in-scope subpackage
        let out_dir = self.out_dir.join(self.arch.to_apk());
        let origin = if self.strip_origin_name {
            None
        } else {
            Some(self.recipe.package.name.clone())
        };

        emit_package(&EmitSpec {
            name: self.recipe.package.name.clone(),
            version: self.recipe.package.version.clone(),
            epoch: self.recipe.package.epoch,
            description: self.recipe.package.description.clone().unwrap_or_default(),
            license: self.recipe.package.license_expression(),
            origin: origin.clone(),
            runtime_deps: self.recipe.package.dependencies.runtime.clone(),
            provides: self.recipe.package.dependencies.provides.clone(),
            arch: self.arch.to_apk().to_string(),
            staged: self
                .workspace_dir
                .join("melange-out")
                .join(&self.recipe.package.name),
            out_dir: out_dir.clone(),
            source_date_epoch: self.source_date_epoch,
            signing_key: self.signing_key.clone(),
            signing_passphrase: self.signing_passphrase.clone(),
        })
        .await?;

        for sp in &self.recipe.subpackages {
            if !self.should_run(sp) {
                continue;
            }
            emit_package(&EmitSpec {
                name: sp.name.clone(),
                version: self.recipe.package.version.clone(),
                epoch: self.recipe.package.epoch,
                description: sp.description.clone().unwrap_or_default(),
                license: self.recipe.package.license_expression(),
                origin: origin.clone(),
                runtime_deps: sp.dependencies.runtime.clone(),
                provides: sp.dependencies.provides.clone(),
                arch: self.arch.to_apk().to_string(),
                staged: self.workspace_dir.join("melange-out").join(&sp.name),
                out_dir: out_dir.clone(),
                source_date_epoch: self.source_date_epoch,
                signing_key: self.signing_key.clone(),
                signing_passphrase: self.signing_passphrase.clone(),
            })
            .await?;
        }

        // Cleanup, warn-only
        if !self.is_build_less() {
            if let Some(guest) = &self.guest_dir {
                if let Err(e) = std::fs::remove_dir_all(guest) {
                    info!("WARNING: unable to clean guest container: {e}");
                }
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.workspace_dir) {
            info!("WARNING: unable to clean workspace: {e}");
        }

        // Index generation
        if self.generate_index {
            let package_dir = self.out_dir.join(self.arch.to_apk());
            info!(
                "generating apk index from packages in {}",
                package_dir.display()
            );

            let mut package_files = vec![package_dir.join(format!(
                "{}-{}.apk",
                self.recipe.package.name,
                self.recipe.package.full_version()
            ))];
            for sp in &self.recipe.subpackages {
                if !self.should_run(sp) {
                    continue;
                }
                package_files.push(package_dir.join(format!(
                    "{}-{}.apk",
                    sp.name,
                    self.recipe.package.full_version()
                )));
            }

            let opts = IndexOptions {
                package_files,
                signing_key: self.signing_key.clone(),
                signing_passphrase: self.signing_passphrase.clone(),
                merge_existing: true,
                index_file: package_dir.join("APKINDEX.tar.gz"),
            };
            let entries = generate_index(&opts).await?;
            write_json_index(&entries, &package_dir.join("APKINDEX.json"))?;
        }

        Ok(())
    }
}

fn append_build_log(workspace_dir: &Path, idx: usize, step: &Pipeline) -> ForgeResult<()> {
    let label = step
        .name
        .as_deref()
        .or(step.uses.as_deref())
        .or_else(|| step.runs.as_deref().and_then(|r| r.lines().next()))
        .unwrap_or("(anonymous step)");

    let path = workspace_dir.join("build.log");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| ForgeError::io(format!("open {}", path.display()), e))?;
    writeln!(file, "{idx}: {label}").map_err(|e| ForgeError::io("writing build log", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::build::{BuildSettings, Build};
    use crate::guest::{GuestBuilder, Layer};
    use crate::orchestration::config::ContainerConfig;
    use crate::orchestration::runner::{OciImageLoader, Runner};
    use async_trait::async_trait;
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default, Debug)]
    struct MockState {
        pod_started: AtomicBool,
        pod_terminated: AtomicBool,
        commands_run: AtomicUsize,
    }

    #[derive(Debug)]
    struct MockRunner {
        state: Arc<MockState>,
        loader: MockLoader,
    }

    impl MockRunner {
        fn new(state: Arc<MockState>) -> Self {
            Self {
                state,
                loader: MockLoader,
            }
        }
    }

    #[derive(Debug)]
    struct MockLoader;

    #[async_trait]
    impl OciImageLoader for MockLoader {
        async fn load_image(&self, layer: &Layer, _arch: Arch) -> ForgeResult<String> {
            Ok(format!("mock:{}", layer.digest))
        }

        async fn remove_image(&self, _image_ref: &str) -> ForgeResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Runner for MockRunner {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn test_usability(&self) -> bool {
            true
        }

        fn temp_dir(&self) -> PathBuf {
            std::env::temp_dir()
        }

        fn oci_image_loader(&self) -> Option<&dyn OciImageLoader> {
            Some(&self.loader)
        }

        async fn start_pod(&self, config: &mut ContainerConfig) -> ForgeResult<()> {
            self.state.pod_started.store(true, Ordering::SeqCst);
            config.pod_id = Some("mock-pod".into());
            Ok(())
        }

        async fn terminate_pod(&self, _config: &ContainerConfig) -> ForgeResult<()> {
            self.state.pod_terminated.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn run_cmd(
            &self,
            _config: &ContainerConfig,
            _command: &[String],
        ) -> ForgeResult<()> {
            self.state.commands_run.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn workspace_tar(
            &self,
            _config: &ContainerConfig,
        ) -> ForgeResult<Option<Box<dyn Read + Send>>> {
            Ok(None)
        }

        async fn close(&self) -> ForgeResult<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct MockGuestBuilder;

    #[async_trait]
    impl GuestBuilder for MockGuestBuilder {
        async fn build_layout(&self, _spec: &GuestSpec, guest_dir: &Path) -> ForgeResult<()> {
            std::fs::create_dir_all(guest_dir.join("bin"))
                .map_err(|e| ForgeError::io("mock layout", e))?;
            std::fs::write(guest_dir.join("bin/sh"), b"#!/bin/sh\n")
                .map_err(|e| ForgeError::io("mock layout", e))?;
            Ok(())
        }
    }

    struct Fixture {
        state: Arc<MockState>,
        build: Build,
        out_dir: TempDir,
        _source: TempDir,
        _workspace: TempDir,
    }

    async fn fixture(recipe_yaml: &str, configure: impl FnOnce(&mut BuildSettings)) -> Fixture {
        let source = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();

        let recipe_path = source.path().join("melange.yaml");
        std::fs::write(&recipe_path, recipe_yaml).unwrap();

        let mut settings = BuildSettings {
            recipe_path: Some(recipe_path),
            arch: Some(Arch::X86_64),
            source_dir: source.path().to_path_buf(),
            workspace_dir: Some(workspace.path().to_path_buf()),
            out_dir: out_dir.path().to_path_buf(),
            cache_dir: None,
            ..Default::default()
        };
        configure(&mut settings);

        let state = Arc::new(MockState::default());
        let runner = Box::new(MockRunner::new(state.clone()));
        let build = Build::with_guest_builder(settings, runner, Box::new(MockGuestBuilder))
            .await
            .unwrap();

        Fixture {
            state,
            build,
            out_dir,
            _source: source,
            _workspace: workspace,
        }
    }

    const BUILDLESS_RECIPE: &str = r#"
package:
  name: lib
  version: "1.0"
  epoch: 0
subpackages:
  - name: lib-doc
"#;

    #[tokio::test]
    async fn buildless_emits_without_pod() {
        let mut fx = fixture(BUILDLESS_RECIPE, |_| {}).await;
        fx.build.build_package().await.unwrap();

        assert!(!fx.state.pod_started.load(Ordering::SeqCst));
        let arch_dir = fx.out_dir.path().join("x86_64");
        assert!(arch_dir.join("lib-1.0-r0.apk").exists());
        assert!(arch_dir.join("lib-doc-1.0-r0.apk").exists());
        assert!(!arch_dir.join("APKINDEX.tar.gz").exists());
    }

    #[tokio::test]
    async fn buildless_with_index() {
        let mut fx = fixture(BUILDLESS_RECIPE, |s| s.generate_index = true).await;
        fx.build.build_package().await.unwrap();

        let arch_dir = fx.out_dir.path().join("x86_64");
        assert!(arch_dir.join("APKINDEX.tar.gz").exists());
        assert!(arch_dir.join("APKINDEX.json").exists());

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(arch_dir.join("APKINDEX.json")).unwrap(),
        )
        .unwrap();
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["lib", "lib-doc"]);
    }

    #[tokio::test]
    async fn arch_skip_sentinel() {
        let source = TempDir::new().unwrap();
        let recipe_path = source.path().join("melange.yaml");
        std::fs::write(
            &recipe_path,
            "package:\n  name: lib\n  version: \"1.0\"\n  target-architecture:\n    - aarch64\n",
        )
        .unwrap();

        let settings = BuildSettings {
            recipe_path: Some(recipe_path),
            arch: Some(Arch::X86_64),
            source_dir: source.path().to_path_buf(),
            ..Default::default()
        };
        let err = Build::new(settings, Box::new(MockRunner::new(Arc::default())))
            .await
            .unwrap_err();
        assert!(err.is_skip_this_arch());
    }

    const PIPELINE_RECIPE: &str = r#"
package:
  name: tool
  version: "2.0"
  epoch: 1
pipeline:
  - runs: |
      make install
subpackages:
  - name: tool-doc
    pipeline:
      - runs: |
          mv docs ${{targets.subpkgdir}}
  - name: tool-extras
    if: "'a' == 'b'"
"#;

    #[tokio::test]
    async fn container_build_runs_pipelines_and_tears_down() {
        let mut fx = fixture(PIPELINE_RECIPE, |_| {}).await;
        fx.build.build_package().await.unwrap();

        assert!(fx.state.pod_started.load(Ordering::SeqCst));
        assert!(fx.state.pod_terminated.load(Ordering::SeqCst));
        // main step + subpackage step; tool-extras is if-false
        assert_eq!(fx.state.commands_run.load(Ordering::SeqCst), 2);

        let arch_dir = fx.out_dir.path().join("x86_64");
        assert!(arch_dir.join("tool-2.0-r1.apk").exists());
        assert!(arch_dir.join("tool-doc-2.0-r1.apk").exists());
        // Consistent skip: no archive for the if-false subpackage
        assert!(!arch_dir.join("tool-extras-2.0-r1.apk").exists());
    }

    #[tokio::test]
    async fn strict_lint_fails_before_emit() {
        // The staged tree stays empty (mock pipelines produce no files),
        // so the "empty" linter reports an issue.
        let mut fx = fixture(PIPELINE_RECIPE, |s| s.fail_on_lint_warning = true).await;
        let err = fx.build.build_package().await.unwrap_err();
        assert!(matches!(err, ForgeError::LintWarning(_)));

        // Strict mode stops before emit
        assert!(!fx.out_dir.path().join("x86_64/tool-2.0-r1.apk").exists());
        // Teardown still happened
        assert!(fx.state.pod_terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn permissive_lint_proceeds() {
        let mut fx = fixture(PIPELINE_RECIPE, |_| {}).await;
        fx.build.build_package().await.unwrap();
        assert!(fx.out_dir.path().join("x86_64/tool-2.0-r1.apk").exists());
    }

    #[tokio::test]
    async fn debug_runner_skips_teardown() {
        let mut fx = fixture(PIPELINE_RECIPE, |s| s.debug_runner = true).await;
        fx.build.build_package().await.unwrap();

        assert!(fx.state.pod_started.load(Ordering::SeqCst));
        assert!(!fx.state.pod_terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn source_date_epoch_lands_in_container_env() {
        let mut fx = fixture(PIPELINE_RECIPE, |s| s.source_date_epoch = 1234567890).await;
        fx.build.build_package().await.unwrap();

        let env = &fx.build.container_config.as_ref().unwrap().environment;
        // The environment override (if set in the test environment)
        // wins; otherwise the configured value is used.
        let expected = std::env::var("SOURCE_DATE_EPOCH")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| "1234567890".to_string());
        assert_eq!(env.get("SOURCE_DATE_EPOCH"), Some(&expected));
    }

    #[tokio::test]
    async fn workspace_removed_after_success() {
        let mut fx = fixture(BUILDLESS_RECIPE, |_| {}).await;
        let workspace = fx.build.workspace_dir.clone();
        fx.build.build_package().await.unwrap();
        assert!(!workspace.exists());
    }
}
