//! Package linters
//!
//! Linters run against the staged file tree of each (sub)package
//! (`{workspace}/melange-out/{name}`). Each finding is routed through a
//! policy callback; linter execution failures are fatal.

use crate::error::{ForgeError, ForgeResult};
use std::path::Path;
use walkdir::WalkDir;

/// Linters applied unless disabled by the recipe's checks block
pub const DEFAULT_LINTERS: &[&str] = &[
    "dev",
    "empty",
    "setuidgid",
    "srv",
    "tempdir",
    "usrlocal",
    "varempty",
    "worldwrite",
];

/// A single linter finding
#[derive(Debug, Clone)]
pub struct LintIssue {
    pub linter: String,
    pub package: String,
    pub detail: String,
}

impl std::fmt::Display for LintIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: lint {}: {}", self.package, self.linter, self.detail)
    }
}

struct FileRecord {
    rel: String,
    mode: u32,
    is_file: bool,
}

/// Run the named linters over a package's staged tree.
///
/// `on_issue` receives each finding; returning from the callback
/// continues linting. An execution error (unreadable tree, unknown
/// linter) aborts with `ForgeError::LintError`.
pub fn lint_build<F>(
    package: &str,
    path: &Path,
    linters: &[String],
    mut on_issue: F,
) -> ForgeResult<()>
where
    F: FnMut(LintIssue),
{
    let mut files = Vec::new();
    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| ForgeError::LintError(e.to_string()))?;
        let meta = entry
            .metadata()
            .map_err(|e| ForgeError::LintError(e.to_string()))?;

        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| ForgeError::LintError(e.to_string()))?
            .display()
            .to_string();

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            meta.mode()
        };
        #[cfg(not(unix))]
        let mode = 0u32;

        files.push(FileRecord {
            rel,
            mode,
            is_file: meta.is_file(),
        });
    }

    for linter in linters {
        let mut report = |detail: String| {
            on_issue(LintIssue {
                linter: linter.clone(),
                package: package.to_string(),
                detail,
            })
        };

        match linter.as_str() {
            "empty" => {
                if !files.iter().any(|f| f.is_file) {
                    report("package is empty but no-provides is not set".into());
                }
            }
            "dev" => {
                for f in files.iter().filter(|f| f.rel.starts_with("dev/")) {
                    report(format!("package writes to /dev: {}", f.rel));
                }
            }
            "srv" => {
                for f in files.iter().filter(|f| f.rel.starts_with("srv/")) {
                    report(format!("package writes to /srv: {}", f.rel));
                }
            }
            "usrlocal" => {
                for f in files.iter().filter(|f| f.rel.starts_with("usr/local/")) {
                    report(format!("/usr/local path found: {}", f.rel));
                }
            }
            "varempty" => {
                for f in files.iter().filter(|f| f.rel.starts_with("var/empty/")) {
                    report(format!("/var/empty is supposed to be empty: {}", f.rel));
                }
            }
            "tempdir" => {
                for f in files.iter().filter(|f| {
                    f.rel.starts_with("tmp/") || f.rel.starts_with("var/tmp/") || f.rel.starts_with("run/")
                }) {
                    report(format!("package writes to a temporary dir: {}", f.rel));
                }
            }
            "setuidgid" => {
                for f in files
                    .iter()
                    .filter(|f| f.is_file && f.mode & 0o6000 != 0)
                {
                    report(format!("setuid/setgid bit set: {}", f.rel));
                }
            }
            "worldwrite" => {
                for f in files.iter().filter(|f| f.is_file && f.mode & 0o002 != 0) {
                    report(format!("world-writeable file: {}", f.rel));
                }
            }
            unknown => {
                return Err(ForgeError::LintError(format!("unknown linter: {unknown}")));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn run(path: &Path, linters: &[&str]) -> Vec<LintIssue> {
        let mut issues = Vec::new();
        let linters: Vec<String> = linters.iter().map(|s| s.to_string()).collect();
        lint_build("testpkg", path, &linters, |i| issues.push(i)).unwrap();
        issues
    }

    #[test]
    fn empty_tree_flagged() {
        let temp = TempDir::new().unwrap();
        let issues = run(temp.path(), &["empty"]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].linter, "empty");
    }

    #[test]
    fn populated_tree_passes_empty() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        fs::write(temp.path().join("usr/bin/tool"), b"x").unwrap();
        assert!(run(temp.path(), &["empty"]).is_empty());
    }

    #[test]
    fn usrlocal_flagged() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("usr/local/bin")).unwrap();
        fs::write(temp.path().join("usr/local/bin/tool"), b"x").unwrap();

        let issues = run(temp.path(), &["usrlocal"]);
        assert!(!issues.is_empty());
        assert!(issues[0].detail.contains("usr/local"));
    }

    #[cfg(unix)]
    #[test]
    fn worldwrite_flagged() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        let file = temp.path().join("usr/bin/loose");
        fs::write(&file, b"x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();

        let issues = run(temp.path(), &["worldwrite"]);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn unknown_linter_is_execution_error() {
        let temp = TempDir::new().unwrap();
        let err = lint_build("testpkg", temp.path(), &["bogus".to_string()], |_| {}).unwrap_err();
        assert!(matches!(err, ForgeError::LintError(_)));
    }
}
