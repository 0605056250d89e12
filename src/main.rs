//! apkforge - declarative APK package build orchestrator
//!
//! CLI entry point that dispatches to subcommands.

use apkforge::cli::{Cli, Commands};
use apkforge::error::ForgeResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ForgeResult<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("apkforge=debug")
    } else {
        EnvFilter::new("apkforge=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        Commands::Build(args) => apkforge::cli::commands::build(args).await,
        Commands::Index(args) => apkforge::cli::commands::index(args).await,
    }
}
