//! Command-line arguments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// apkforge - declarative APK package build orchestrator
#[derive(Debug, Parser)]
#[command(name = "apkforge", version, about = "Builds signed, reproducible APK packages from YAML recipes")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a package from a recipe
    Build(BuildArgs),

    /// Rebuild a signed index over emitted archives
    Index(IndexArgs),
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Recipe file (defaults to probing .melange.yaml and friends)
    pub recipe: Option<PathBuf>,

    /// Target architecture (defaults to the host)
    #[arg(long)]
    pub arch: Option<String>,

    /// Container runner backend
    #[arg(long, default_value = "docker")]
    pub runner: String,

    /// Source directory copied into the workspace
    #[arg(long, default_value = ".")]
    pub source_dir: PathBuf,

    /// Workspace root (a temporary directory when omitted)
    #[arg(long)]
    pub workspace_dir: Option<PathBuf>,

    /// Guest root directory (a temporary directory when omitted)
    #[arg(long)]
    pub guest_dir: Option<PathBuf>,

    /// Output directory for emitted archives
    #[arg(long, default_value = "./packages")]
    pub out_dir: PathBuf,

    /// Local cache directory bind-mounted into the build
    #[arg(long, default_value = "./melange-cache")]
    pub cache_dir: PathBuf,

    /// APK package cache consulted while building the guest
    #[arg(long)]
    pub apk_cache_dir: Option<PathBuf>,

    /// Remote cache source (gs://bucket/prefix)
    #[arg(long)]
    pub cache_source: Option<String>,

    /// Ignore-file name at the source root
    #[arg(long, default_value = ".melangeignore")]
    pub workspace_ignore: String,

    /// Directories searched for 'uses' pipelines, in order
    #[arg(long = "pipeline-dir")]
    pub pipeline_dirs: Vec<PathBuf>,

    /// RSA private key for signing archives and the index
    #[arg(long)]
    pub signing_key: Option<PathBuf>,

    /// Passphrase for the signing key
    #[arg(long, default_value = "")]
    pub signing_passphrase: String,

    /// Namespace recorded in SBOMs
    #[arg(long)]
    pub namespace: Option<String>,

    /// Source date epoch (seconds); the SOURCE_DATE_EPOCH environment
    /// variable overrides this
    #[arg(long, default_value_t = 0)]
    pub source_date_epoch: i64,

    /// Binary copied over the guest's /bin/sh
    #[arg(long)]
    pub overlay_binsh: Option<PathBuf>,

    /// Extra trusted keys for the guest builder
    #[arg(long = "keyring-append")]
    pub extra_keys: Vec<String>,

    /// Extra repositories for the guest builder
    #[arg(long = "repository-append")]
    pub extra_repos: Vec<String>,

    /// Recipe build options to enable
    #[arg(long = "build-option")]
    pub build_options: Vec<String>,

    /// Keep the workspace path as-is when resuming a prior build
    #[arg(long)]
    pub continue_label: Option<String>,

    /// Omit the origin field from emitted packages
    #[arg(long)]
    pub strip_origin_name: bool,

    /// Rebuild the signed index after emitting
    #[arg(long)]
    pub generate_index: bool,

    /// Skip workspace population entirely
    #[arg(long)]
    pub empty_workspace: bool,

    /// Write a build.log of executed pipeline steps into the workspace
    #[arg(long)]
    pub create_build_log: bool,

    /// Treat linter warnings as build failures
    #[arg(long)]
    pub fail_on_lint_warning: bool,

    /// Leave the pod running for debugging
    #[arg(long)]
    pub debug_runner: bool,

    /// Keep a shell open in the build environment on failure
    #[arg(long)]
    pub interactive: bool,

    /// Remove build state on close
    #[arg(long = "rm")]
    pub remove: bool,

    /// Default CPU request when the recipe declares none
    #[arg(long)]
    pub default_cpu: Option<String>,

    /// Default memory request when the recipe declares none
    #[arg(long)]
    pub default_memory: Option<String>,

    /// Default build timeout in seconds when the recipe declares none
    #[arg(long)]
    pub default_timeout: Option<u64>,
}

#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Archives to index
    pub packages: Vec<PathBuf>,

    /// RSA private key for signing the index
    #[arg(long)]
    pub signing_key: Option<PathBuf>,

    /// Passphrase for the signing key
    #[arg(long, default_value = "")]
    pub signing_passphrase: String,

    /// Retain existing index entries for other packages
    #[arg(long)]
    pub merge: bool,

    /// Output path for APKINDEX.tar.gz
    #[arg(long, default_value = "APKINDEX.tar.gz")]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_parse() {
        let cli = Cli::parse_from([
            "apkforge",
            "build",
            "melange.yaml",
            "--arch",
            "aarch64",
            "--generate-index",
            "--pipeline-dir",
            "/usr/share/apkforge/pipelines",
        ]);

        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.recipe, Some(PathBuf::from("melange.yaml")));
                assert_eq!(args.arch.as_deref(), Some("aarch64"));
                assert!(args.generate_index);
                assert_eq!(args.pipeline_dirs.len(), 1);
            }
            _ => panic!("expected build command"),
        }
    }

    #[test]
    fn index_args_parse() {
        let cli = Cli::parse_from([
            "apkforge", "index", "a.apk", "b.apk", "--merge", "--output", "out/APKINDEX.tar.gz",
        ]);

        match cli.command {
            Commands::Index(args) => {
                assert_eq!(args.packages.len(), 2);
                assert!(args.merge);
            }
            _ => panic!("expected index command"),
        }
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
