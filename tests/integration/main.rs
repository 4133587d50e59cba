//! Integration tests for previewd

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn previewd(config_dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("previewd");
        cmd.env("PREVIEWD_CONFIG", config_dir.path().join("config.toml"))
            .env_remove("RUST_LOG");
        cmd
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Preview Test")
            .env("GIT_AUTHOR_EMAIL", "preview@example.com")
            .env("GIT_COMMITTER_NAME", "Preview Test")
            .env("GIT_COMMITTER_EMAIL", "preview@example.com")
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    /// A one-commit repository plus a config pointing at it
    fn repo_fixture() -> (TempDir, String) {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "-q"]);
        std::fs::write(repo.join("README"), "preview\n").unwrap();
        git(&repo, &["add", "README"]);
        git(&repo, &["commit", "-q", "-m", "initial"]);
        let head = git(&repo, &["rev-parse", "HEAD"]);

        let config = format!("[repo]\ngit_dir = {:?}\n", repo.display().to_string());
        std::fs::write(temp.path().join("config.toml"), config).unwrap();
        (temp, head)
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        previewd(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("on-demand preview builds"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        previewd(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("previewd"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        previewd(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        previewd(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[coordinator]"))
            .stdout(predicate::str::contains("ttl_secs = 5"));
    }

    #[test]
    fn config_init_then_show() {
        let temp = TempDir::new().unwrap();
        previewd(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(temp.path().join("config.toml").exists());

        previewd(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stderr(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_reports_hint() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[server]\nport = \"x\"\n").unwrap();
        previewd(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("config init --force"));
    }

    #[test]
    fn resolve_rejects_short_abbreviation() {
        let temp = TempDir::new().unwrap();
        previewd(&temp)
            .args(["resolve", "abc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("too short"));
    }

    #[test]
    fn resolve_expands_abbreviation() {
        if !git_available() {
            return;
        }
        let (temp, head) = repo_fixture();
        previewd(&temp)
            .args(["resolve", &head[..8]])
            .assert()
            .success()
            .stdout(predicate::str::contains(head.as_str()));
    }

    #[test]
    fn resolve_unknown_commit() {
        if !git_available() {
            return;
        }
        let (temp, head) = repo_fixture();
        // Flip the first nibble so the prefix cannot match the only commit
        let first = if head.starts_with('0') { "1" } else { "0" };
        let prefix = format!("{}{}", first, &head[1..12]);
        previewd(&temp)
            .args(["resolve", &prefix])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No such commit"));
    }
}
