//! apkforge - declarative APK package build orchestrator
//!
//! Builds signed, reproducible APK packages from YAML recipes: a guest
//! root filesystem is materialized for the recipe's environment, the
//! build pipeline runs inside an isolated container, and the produced
//! file trees are linted, described in SBOMs, emitted as signed
//! archives, and optionally indexed.

pub mod apk;
pub mod arch;
pub mod build;
pub mod cli;
pub mod error;
pub mod guest;
pub mod lint;
pub mod orchestration;
pub mod pipeline;
pub mod recipe;
pub mod sbom;

pub use build::{Build, BuildSettings};
pub use error::{ForgeError, ForgeResult};
