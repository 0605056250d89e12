//! Build command - run one package build for one architecture

use crate::arch::Arch;
use crate::build::{Build, BuildSettings};
use crate::cli::args::BuildArgs;
use crate::error::{ForgeError, ForgeResult};
use crate::orchestration::runner_by_name;
use std::time::Duration;
use tracing::info;

/// Execute the build command
pub async fn execute(args: BuildArgs) -> ForgeResult<()> {
    let arch = match &args.arch {
        Some(name) => Some(name.parse::<Arch>().map_err(ForgeError::InvalidArch)?),
        None => None,
    };

    let runner = runner_by_name(&args.runner)?;

    let settings = BuildSettings {
        recipe_path: args.recipe,
        arch,
        source_dir: args.source_dir,
        workspace_dir: args.workspace_dir,
        guest_dir: args.guest_dir,
        out_dir: args.out_dir,
        cache_dir: Some(args.cache_dir),
        apk_cache_dir: args.apk_cache_dir,
        cache_source: args.cache_source,
        workspace_ignore: args.workspace_ignore,
        pipeline_dirs: args.pipeline_dirs,
        signing_key: args.signing_key,
        signing_passphrase: args.signing_passphrase,
        namespace: args.namespace,
        source_date_epoch: args.source_date_epoch,
        bin_sh_overlay: args.overlay_binsh,
        extra_keys: args.extra_keys,
        extra_repos: args.extra_repos,
        enabled_build_options: args.build_options,
        continue_label: args.continue_label,
        strip_origin_name: args.strip_origin_name,
        generate_index: args.generate_index,
        empty_workspace: args.empty_workspace,
        create_build_log: args.create_build_log,
        fail_on_lint_warning: args.fail_on_lint_warning,
        debug: false,
        debug_runner: args.debug_runner,
        interactive: args.interactive,
        remove: args.remove,
        default_cpu: args.default_cpu,
        default_memory: args.default_memory,
        default_timeout: args.default_timeout.map(Duration::from_secs),
    };

    let mut build = match Build::new(settings, runner).await {
        Ok(build) => build,
        Err(e) if e.is_skip_this_arch() => {
            info!("recipe does not target this architecture; skipping");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let result = build.build_package().await;
    let close_result = build.close().await;

    result?;
    close_result
}
