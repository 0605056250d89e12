//! Workspace population
//!
//! Copies the source tree into the workspace directory, honoring a
//! `.gitignore`-style ignore file at the source root. Only regular
//! files are considered; permission bits are preserved.

use crate::error::{ForgeError, ForgeResult};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Load ignore rules from `{source_dir}/{ignore_name}`.
/// A missing file yields an empty rule set.
pub fn load_ignore_rules(source_dir: &Path, ignore_name: &str) -> ForgeResult<Gitignore> {
    let ignore_path = source_dir.join(ignore_name);
    if !ignore_path.is_file() {
        return Ok(Gitignore::empty());
    }

    info!("loading ignore rules from {}", ignore_path.display());

    let mut builder = GitignoreBuilder::new(source_dir);
    if let Some(err) = builder.add(&ignore_path) {
        return Err(ForgeError::io(
            format!("loading ignore rules from {}", ignore_path.display()),
            std::io::Error::other(err),
        ));
    }

    builder.build().map_err(|e| {
        ForgeError::io(
            format!("compiling ignore rules from {}", ignore_path.display()),
            std::io::Error::other(e),
        )
    })
}

/// Copy the source tree into the workspace.
///
/// Directories are never filtered directly; the ignore match applies to
/// the relative path of each regular file.
pub fn populate_workspace(
    source_dir: &Path,
    workspace_dir: &Path,
    ignore_name: &str,
) -> ForgeResult<()> {
    let rules = load_ignore_rules(source_dir, ignore_name)?;

    for entry in WalkDir::new(source_dir).min_depth(1) {
        let entry = entry.map_err(|e| {
            ForgeError::io(
                format!("walking {}", source_dir.display()),
                std::io::Error::other(e),
            )
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .expect("walkdir yields children of source_dir");

        if rules.matched(rel, false).is_ignore() {
            continue;
        }

        debug!("  -> {}", rel.display());
        copy_file(source_dir, rel, workspace_dir)?;
    }

    Ok(())
}

/// Copy `{base}/{rel}` to `{dest}/{rel}`, creating parent directories
/// and preserving permission bits.
pub fn copy_file(base: &Path, rel: &Path, dest: &Path) -> ForgeResult<()> {
    let src_path = base.join(rel);
    let dest_path = dest.join(rel);

    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ForgeError::io(format!("mkdir -p {}", parent.display()), e))?;
    }

    std::fs::copy(&src_path, &dest_path).map_err(|e| {
        ForgeError::io(
            format!("copy {} -> {}", src_path.display(), dest_path.display()),
            e,
        )
    })?;

    Ok(())
}
