//! Error types for apkforge
//!
//! All modules use `ForgeResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for apkforge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// All errors that can occur while orchestrating a package build
#[derive(Error, Debug)]
pub enum ForgeError {
    // Configuration errors — fatal at construction
    #[error("recipe file is missing; tried {0}")]
    RecipeNotFound(String),

    #[error("failed to load recipe {path}: {reason}")]
    RecipeInvalid { path: PathBuf, reason: String },

    #[error("unable to run containers using {name}, specify --runner and one of {available}")]
    RunnerUnusable { name: String, available: String },

    /// Distinguished sentinel: the recipe does not target the current
    /// architecture. Callers match on this variant and skip silently.
    #[error("skip this arch")]
    SkipThisArch,

    #[error("invalid SOURCE_DATE_EPOCH value {value:?}: {reason}")]
    InvalidSourceDateEpoch { value: String, reason: String },

    #[error("{0}")]
    InvalidArch(String),

    // Container errors
    #[error("unable to build guest: {0}")]
    GuestBuild(String),

    #[error("runner {0} does not support OCI image loading")]
    OciLoaderUnsupported(String),

    #[error("unable to load image: {0}")]
    ImageLoad(String),

    #[error("unable to start pod: {0}")]
    PodStart(String),

    #[error("unable to terminate pod: {0}")]
    PodTerminate(String),

    #[error("retrieving workspace: {0}")]
    WorkspaceTar(String),

    // Pipeline errors
    #[error("unable to run pipeline step {step}: {reason}")]
    Pipeline { step: String, reason: String },

    #[error("unknown pipeline {name}; searched {dirs:?}")]
    PipelineNotFound { name: String, dirs: Vec<PathBuf> },

    #[error("evaluating if-conditional {expr:?}: {reason}")]
    Condition { expr: String, reason: String },

    // Remote cache errors
    #[error("failed to fetch remote cache object {object}: {reason}")]
    CacheFetch { object: String, reason: String },

    #[error("storage client error: {0}")]
    Storage(#[from] reqwest::Error),

    // Workspace retrieval errors
    #[error("unexpected tar type {typeflag} for {path}")]
    UnexpectedTarEntry { typeflag: u8, path: String },

    // Lint errors
    #[error("package linter warning: {0}")]
    LintWarning(String),

    #[error("package linter error: {0}")]
    LintError(String),

    // Emit / index errors
    #[error("unable to emit package {name}: {reason}")]
    Emit { name: String, reason: String },

    #[error("unable to generate index: {0}")]
    Index(String),

    #[error("signing failed for {path}: {reason}")]
    Sign { path: PathBuf, reason: String },

    // Timeout — cause is observable to callers
    #[error("build exceeded its timeout of {timeout:?}")]
    Timeout { timeout: Duration },

    // IO errors
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("command failed to spawn: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command failed: {command}: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Joined teardown failures; best-effort actions report all of them
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Teardown(Vec<ForgeError>),
}

impl ForgeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Join best-effort teardown errors, dropping successes.
    /// Returns `Ok(())` when every action succeeded.
    pub fn join(errs: Vec<ForgeResult<()>>) -> ForgeResult<()> {
        let failures: Vec<ForgeError> = errs.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self::Teardown(failures))
        }
    }

    /// Whether this is the skip-this-arch sentinel
    pub fn is_skip_this_arch(&self) -> bool {
        matches!(self, Self::SkipThisArch)
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RecipeNotFound(_) => {
                Some("Run inside a directory with a .melange.yaml, or pass a recipe path")
            }
            Self::RunnerUnusable { .. } => {
                Some("Check that the container runtime is installed and running")
            }
            Self::Sign { .. } => {
                Some("Check that openssl is installed and the signing key is a valid RSA private key")
            }
            _ => None,
        }
    }
}
