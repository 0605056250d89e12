//! Integration tests for apkforge

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn apkforge() -> Command {
        cargo_bin_cmd!("apkforge")
    }

    #[test]
    fn help_displays() {
        apkforge()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("APK packages"));
    }

    #[test]
    fn version_displays() {
        apkforge()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("apkforge"));
    }

    #[test]
    fn build_without_recipe_fails() {
        let temp = TempDir::new().unwrap();
        apkforge()
            .current_dir(temp.path())
            .arg("build")
            .assert()
            .failure()
            .stderr(predicate::str::contains("recipe file is missing"));
    }

    #[test]
    fn build_skips_foreign_arch_silently() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("melange.yaml"),
            "package:\n  name: lib\n  version: \"1.0\"\n  target-architecture:\n    - s390x\n",
        )
        .unwrap();

        // The skip-this-arch sentinel is non-fatal; nothing is written.
        apkforge()
            .current_dir(temp.path())
            .args(["build", "melange.yaml", "--arch", "x86_64"])
            .assert()
            .success();

        assert!(!temp.path().join("packages").exists());
    }

    #[test]
    fn build_rejects_unknown_runner() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("melange.yaml"),
            "package:\n  name: lib\n  version: \"1.0\"\n",
        )
        .unwrap();

        apkforge()
            .current_dir(temp.path())
            .args(["build", "melange.yaml", "--runner", "qemu"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unable to run containers"));
    }

    #[test]
    fn index_writes_empty_index() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("APKINDEX.tar.gz");

        apkforge()
            .args(["index", "--output"])
            .arg(&output)
            .assert()
            .success();

        assert!(output.exists());
        assert!(temp.path().join("APKINDEX.json").exists());
    }
}
