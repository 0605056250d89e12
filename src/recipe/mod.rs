//! Recipe loading and discovery

pub mod cond;
pub mod schema;
pub mod subst;

pub use schema::{Recipe, Subpackage};

use crate::error::{ForgeError, ForgeResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Probed file names, in order, when no recipe path is given
pub const DISCOVERY_ORDER: [&str; 4] = [
    ".melange.yaml",
    ".melange.yml",
    "melange.yaml",
    "melange.yml",
];

/// Locate the recipe file: honor an explicit path, else probe the
/// discovery order in the current directory.
pub fn discover(explicit: Option<&Path>) -> ForgeResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    for candidate in DISCOVERY_ORDER {
        if Path::new(candidate).is_file() {
            info!("no recipe file provided -- using {candidate}");
            return Ok(PathBuf::from(candidate));
        }
    }

    Err(ForgeError::RecipeNotFound(DISCOVERY_ORDER.join(", ")))
}

/// Parse and validate a recipe file
pub fn parse(path: &Path) -> ForgeResult<Recipe> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ForgeError::io(format!("reading recipe {}", path.display()), e))?;

    let recipe: Recipe = serde_yaml::from_str(&content).map_err(|e| ForgeError::RecipeInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    validate(&recipe).map_err(|reason| ForgeError::RecipeInvalid {
        path: path.to_path_buf(),
        reason,
    })?;

    Ok(recipe)
}

fn validate(recipe: &Recipe) -> Result<(), String> {
    if recipe.package.name.is_empty() {
        return Err("package.name must be set".into());
    }
    if recipe.package.version.is_empty() {
        return Err("package.version must be set".into());
    }
    for sp in &recipe.subpackages {
        if sp.name.is_empty() {
            return Err("subpackage name must be set".into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parse_valid_recipe() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("melange.yaml");
        fs::write(
            &path,
            "package:\n  name: lib\n  version: \"1.0\"\n",
        )
        .unwrap();

        let recipe = parse(&path).unwrap();
        assert_eq!(recipe.package.name, "lib");
    }

    #[test]
    fn parse_rejects_missing_name() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("melange.yaml");
        fs::write(&path, "package:\n  version: \"1.0\"\n").unwrap();

        let err = parse(&path).unwrap_err();
        assert!(matches!(err, ForgeError::RecipeInvalid { .. }));
    }

    #[test]
    fn discover_honors_explicit_path() {
        let path = discover(Some(Path::new("/tmp/custom.yaml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/custom.yaml"));
    }

    #[test]
    fn discovery_order_is_stable() {
        assert_eq!(
            DISCOVERY_ORDER,
            [".melange.yaml", ".melange.yml", "melange.yaml", "melange.yml"]
        );
    }
}
