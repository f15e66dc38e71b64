//! CLI smoke tests for the capstone binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a capstone Command rooted in `dir` with its own config.
fn capstone(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("capstone");
    cmd.current_dir(dir)
        .env("CAPSTONE_CONFIG", dir.join("capstone.toml"))
        .env_remove("CAPSTONE_DB_PATH")
        .env_remove("CAPSTONE_API_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

/// Temp dir with a config pointing every path inside it.
fn workspace(extra: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let config = format!(
        "[database]\npath = \"{}\"\n\n[queue]\ndir = \"{}\"\n\n[checker]\nmode = \"process\"\n{}",
        dir.path().join("capstone.db").display(),
        dir.path().join("tasks").display(),
        extra
    );
    fs::write(dir.path().join("capstone.toml"), config).unwrap();
    dir
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = workspace("");
        capstone(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run-checks"));
    }

    #[test]
    fn test_version() {
        let dir = workspace("");
        capstone(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_init_db_creates_database() {
        let dir = workspace("");
        capstone(dir.path())
            .arg("init-db")
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));
        assert!(dir.path().join("capstone.db").exists());
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = workspace("");
        capstone(dir.path()).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Administration
// =============================================================================

mod admin {
    use super::*;

    #[test]
    fn test_create_site_and_user() {
        let dir = workspace("");
        capstone(dir.path())
            .args(["site", "create", "pipal", "pipal.test"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created site pipal (pipal.test)"));
        capstone(dir.path())
            .args(["user", "create", "--site", "pipal", "alice", "--email", "a@example.com"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created user alice on pipal"));
    }

    #[test]
    fn test_duplicate_site_fails() {
        let dir = workspace("");
        capstone(dir.path())
            .args(["site", "create", "pipal", "pipal.test"])
            .assert()
            .success();
        capstone(dir.path())
            .args(["site", "create", "pipal", "other.test"])
            .assert()
            .failure();
    }

    #[test]
    fn test_user_on_unknown_site_fails() {
        let dir = workspace("");
        capstone(dir.path())
            .args(["user", "create", "--site", "nope", "alice"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Site nope not found"));
    }

    #[test]
    fn test_history_of_unstarted_project_fails() {
        let dir = workspace("");
        capstone(dir.path())
            .args(["site", "create", "pipal", "pipal.test"])
            .assert()
            .success();
        capstone(dir.path())
            .args(["user-project", "history", "--site", "pipal", "alice", "blog"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("has not started project blog"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_masks_secrets() {
        let dir = workspace("\n[server]\napi_token = \"very-secret\"\nport = 9100\n");
        capstone(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"))
            .stdout(predicate::str::contains("********"))
            .stdout(predicate::str::contains("very-secret").not());
    }

    #[test]
    fn test_config_env_overrides_file() {
        let dir = workspace("\n[server]\npublic_url = \"http://from-file\"\n");
        capstone(dir.path())
            .env("CAPSTONE_PUBLIC_URL", "http://from-env")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("http://from-env"));
    }

    #[test]
    fn test_config_validate_warns_on_missing_tokens() {
        let dir = workspace("");
        capstone(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("server.api_token is empty"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("capstone.toml"), "[server\nport = ").unwrap();
        capstone(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse capstone.toml"));
    }
}

// =============================================================================
// Checker entry point
// =============================================================================

mod run_checks {
    use super::*;

    #[test]
    fn test_unreachable_api_reports_failed_run() {
        let dir = workspace("");
        let output = dir.path().join("result.json");
        capstone(dir.path())
            .args([
                "run-checks",
                "--capstone-url",
                "http://127.0.0.1:9",
                "--capstone-token",
                "t",
                "--project-name",
                "blog",
                "--username",
                "alice",
                "--output",
            ])
            .arg(&output)
            .assert()
            .success();

        let result: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(result["ok"], false);
        assert!(result["log"].as_str().unwrap().contains("Check run failed"));
        assert_eq!(result["tasks"], serde_json::json!([]));
    }
}
