//! The `capstone run-checks` side: fetch the project definition and the
//! learner's repo, then evaluate checks task by task.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{CheckContext, CheckRegistry, CheckerOutput, TaskOutcome};
use crate::git;
use crate::store::models::ProjectDetail;

/// Optional script in the project repo run before any check.
pub const SETUP_SCRIPT: &str = "setup.sh";

#[derive(Debug, Clone)]
pub struct RunChecksArgs {
    pub capstone_url: String,
    pub capstone_token: String,
    pub project_name: String,
    pub username: String,
}

/// The part of the user project API response the checker needs.
#[derive(Debug, Deserialize)]
struct UserProjectInfo {
    git_url: String,
    #[serde(default)]
    app_url: Option<String>,
}

/// Bearer-authenticated client for the Capstone JSON API.
struct CapstoneApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl CapstoneApi {
    fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GET {} returned {}: {}", url, status, body);
        }
        response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))
    }
}

/// Run every check for one learner. Never fails: a broken run yields
/// `ok: false` with the error appended to the log.
pub async fn run_checks(args: &RunChecksArgs, registry: &CheckRegistry) -> CheckerOutput {
    let mut log = String::new();
    match prepare_and_run(args, registry, &mut log).await {
        Ok(tasks) => CheckerOutput {
            ok: true,
            log,
            tasks,
        },
        Err(e) => {
            let _ = writeln!(log, "Check run failed: {:#}", e);
            CheckerOutput {
                ok: false,
                log,
                tasks: Vec::new(),
            }
        }
    }
}

async fn prepare_and_run(
    args: &RunChecksArgs,
    registry: &CheckRegistry,
    log: &mut String,
) -> Result<Vec<TaskOutcome>> {
    let api = CapstoneApi::new(&args.capstone_url, &args.capstone_token);
    let project: ProjectDetail = api
        .get(&format!("/api/projects/{}", args.project_name))
        .await?;
    let info: UserProjectInfo = api
        .get(&format!(
            "/api/users/{}/projects/{}",
            args.username, args.project_name
        ))
        .await?;

    let work = tempfile::tempdir().context("Failed to create work directory")?;
    if let Some(url) = &project.git_url {
        let project_dir = work.path().join("project");
        git::clone(url, &project_dir)
            .await
            .context("Failed to clone project repo")?;
        run_setup(&project_dir, log).await?;
    }
    let app_dir = work.path().join("app");
    git::clone(&info.git_url, &app_dir)
        .await
        .context("Failed to clone user repo")?;

    let ctx = CheckContext::new(info.app_url, app_dir);
    Ok(evaluate(&project, &ctx, registry, log).await)
}

async fn run_setup(project_dir: &Path, log: &mut String) -> Result<()> {
    if !project_dir.join(SETUP_SCRIPT).is_file() {
        return Ok(());
    }
    let output = tokio::process::Command::new("sh")
        .arg(SETUP_SCRIPT)
        .current_dir(project_dir)
        .stdin(Stdio::null())
        .output()
        .await
        .context("Failed to run project setup")?;
    let _ = writeln!(log, "$ sh {}", SETUP_SCRIPT);
    log.push_str(&String::from_utf8_lossy(&output.stdout));
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        anyhow::bail!("Project setup exited with {}", output.status);
    }
    Ok(())
}

/// Evaluate tasks in order, stopping after the first task with a check that
/// did not pass. Earlier results are kept.
pub async fn evaluate(
    project: &ProjectDetail,
    ctx: &CheckContext,
    registry: &CheckRegistry,
    log: &mut String,
) -> Vec<TaskOutcome> {
    let mut results = Vec::new();
    for task in &project.tasks {
        let mut checks = Vec::with_capacity(task.checks.len());
        for check in &task.checks {
            let outcome = registry.run(&check.name, ctx, &check.args).await;
            let _ = writeln!(
                log,
                "{}/{}: {}{}",
                task.name,
                check.name,
                outcome.status.as_str(),
                outcome
                    .message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            );
            checks.push(outcome);
        }
        let outcome = TaskOutcome {
            name: task.name.clone(),
            checks,
        };
        let passed = outcome.all_pass();
        results.push(outcome);
        if !passed {
            break;
        }
    }
    results
}

/// Write the result file the invoking worker reads back.
pub fn write_output(path: &Path, output: &CheckerOutput) -> Result<()> {
    let json = serde_json::to_string_pretty(output).context("Failed to serialize checker output")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write checker output to {}", path.display()))
}

pub fn read_output(path: &Path) -> Result<CheckerOutput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read checker output {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse checker output")
}
