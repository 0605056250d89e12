//! Variable substitution for pipelines and conditionals
//!
//! Recipe text may reference `${{package.name}}`, `${{vars.*}}`,
//! `${{inputs.*}}` and friends. The substitution map is built once per
//! (sub)package scope and applied to `runs` bodies, `with` values, and
//! `if` expressions.

use crate::arch::Arch;
use crate::orchestration::config::DEFAULT_WORKSPACE_DIR;
use crate::recipe::schema::{Package, Subpackage};
use std::collections::HashMap;

/// A resolved substitution scope
#[derive(Debug, Clone)]
pub struct Substitutions {
    map: HashMap<String, String>,
}

impl Substitutions {
    /// Build the substitution map for the main package scope.
    pub fn new(
        package: &Package,
        vars: &HashMap<String, String>,
        arch: Arch,
        triplet_gnu: &str,
        triplet_rust: &str,
    ) -> Self {
        let mut map = HashMap::new();

        map.insert("package.name".into(), package.name.clone());
        map.insert("package.version".into(), package.version.clone());
        map.insert("package.epoch".into(), package.epoch.to_string());
        map.insert("package.full-version".into(), package.full_version());
        map.insert("build.arch".into(), arch.to_apk().to_string());
        map.insert("host.triplet.gnu".into(), triplet_gnu.to_string());
        map.insert("host.triplet.rust".into(), triplet_rust.to_string());
        map.insert(
            "targets.destdir".into(),
            format!("{DEFAULT_WORKSPACE_DIR}/melange-out/{}", package.name),
        );

        for (k, v) in vars {
            map.insert(format!("vars.{k}"), v.clone());
        }

        Self { map }
    }

    /// Narrow the scope to a subpackage: adds `${{targets.subpkgdir}}`
    /// and repoints `${{subpkg.name}}`.
    pub fn for_subpackage(&self, sp: &Subpackage) -> Self {
        let mut scoped = self.clone();
        scoped.map.insert("subpkg.name".into(), sp.name.clone());
        scoped.map.insert(
            "targets.subpkgdir".into(),
            format!("{DEFAULT_WORKSPACE_DIR}/melange-out/{}", sp.name),
        );
        scoped
    }

    /// Extend the scope with `uses` pipeline inputs (`${{inputs.*}}`).
    pub fn with_inputs(&self, inputs: &HashMap<String, String>) -> Self {
        let mut scoped = self.clone();
        for (k, v) in inputs {
            // Input values may themselves reference the outer scope.
            scoped.map.insert(format!("inputs.{k}"), self.replace(v));
        }
        scoped
    }

    /// Look up a single key, as consumed by the conditional evaluator.
    /// Unknown keys resolve to the empty string.
    pub fn lookup(&self, key: &str) -> String {
        self.map.get(key).cloned().unwrap_or_default()
    }

    /// Replace every `${{key}}` reference in `text`.
    pub fn replace(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (k, v) in &self.map {
            out = out.replace(&format!("${{{{{k}}}}}"), v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Substitutions {
        let package = Package {
            name: "zlib".into(),
            version: "1.3".into(),
            epoch: 2,
            ..Default::default()
        };
        let mut vars = HashMap::new();
        vars.insert("prefix".into(), "/usr".into());
        Substitutions::new(
            &package,
            &vars,
            Arch::X86_64,
            "x86_64-pc-linux-gnu",
            "x86_64-unknown-linux-gnu",
        )
    }

    #[test]
    fn package_fields_resolve() {
        let subs = base();
        assert_eq!(subs.replace("${{package.name}}-${{package.version}}"), "zlib-1.3");
        assert_eq!(subs.lookup("package.full-version"), "1.3-r2");
    }

    #[test]
    fn destdir_points_into_workspace() {
        let subs = base();
        assert_eq!(
            subs.lookup("targets.destdir"),
            "/home/build/melange-out/zlib"
        );
    }

    #[test]
    fn vars_are_namespaced() {
        let subs = base();
        assert_eq!(subs.replace("--prefix=${{vars.prefix}}"), "--prefix=/usr");
    }

    #[test]
    fn subpackage_scope_adds_subpkgdir() {
        let sp = Subpackage {
            name: "zlib-doc".into(),
            ..Default::default()
        };
        let subs = base().for_subpackage(&sp);
        assert_eq!(
            subs.lookup("targets.subpkgdir"),
            "/home/build/melange-out/zlib-doc"
        );
        // Main package scope is retained
        assert_eq!(subs.lookup("package.name"), "zlib");
    }

    #[test]
    fn inputs_resolve_outer_references() {
        let mut with = HashMap::new();
        with.insert("uri".into(), "https://example.com/${{package.name}}.tar.gz".into());
        let subs = base().with_inputs(&with);
        assert_eq!(
            subs.lookup("inputs.uri"),
            "https://example.com/zlib.tar.gz"
        );
    }

    #[test]
    fn unknown_keys_are_empty() {
        assert_eq!(base().lookup("vars.nope"), "");
    }
}
