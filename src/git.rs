//! Thin async wrappers over the `git` CLI.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};

/// Identity used for commits the platform makes on a learner's behalf.
const COMMITTER_NAME: &str = "Capstone";
const COMMITTER_EMAIL: &str = "capstone@localhost";

/// Run `git <args>` in `dir` and return trimmed stdout.
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Clone `url` into `dest`. `dest` must not exist yet.
pub async fn clone(url: &str, dest: &Path) -> Result<()> {
    let parent = dest.parent().context("Clone destination has no parent")?;
    let dest_str = dest.to_str().context("Clone destination is not valid UTF-8")?;
    run_git(parent, &["clone", "--quiet", url, dest_str]).await?;
    Ok(())
}

pub async fn head_commit(dir: &Path) -> Result<String> {
    run_git(dir, &["rev-parse", "HEAD"]).await
}

/// Stage everything and commit. Returns false when there was nothing to commit.
pub async fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    run_git(dir, &["add", "--all"]).await?;
    let status = run_git(dir, &["status", "--porcelain"]).await?;
    if status.is_empty() {
        return Ok(false);
    }
    let name = format!("user.name={}", COMMITTER_NAME);
    let email = format!("user.email={}", COMMITTER_EMAIL);
    run_git(dir, &["-c", &name, "-c", &email, "commit", "--quiet", "-m", message]).await?;
    Ok(true)
}

/// Push the current HEAD to `branch` on origin.
pub async fn push(dir: &Path, branch: &str) -> Result<()> {
    let refspec = format!("HEAD:refs/heads/{}", branch);
    run_git(dir, &["push", "--quiet", "origin", &refspec]).await?;
    Ok(())
}

/// Zip archive of the tree at HEAD.
pub async fn archive_zip(dir: &Path) -> Result<Vec<u8>> {
    let output = tokio::process::Command::new("git")
        .args(["archive", "--format=zip", "HEAD"])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run git archive")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git archive failed: {}", stderr.trim());
    }
    Ok(output.stdout)
}

/// True when a `git` executable can be run.
pub async fn available() -> bool {
    tokio::process::Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
