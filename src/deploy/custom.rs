//! Deployer backed by an external deployment API.
//!
//! `POST /apps {user, project}` returns the app (reusing an existing one),
//! a zip of the learner's HEAD is uploaded to `POST /apps/{id}/deployments`,
//! and `GET /apps/{id}/deployments/{n}` is polled until the deployment
//! reaches a terminal status.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::Instrument;

use super::{CommandLog, DeployResult, DeployTarget, Deployer};
use crate::config::CustomDeploySection;
use crate::git;
use crate::logging;
use crate::store::models::DeployerKind;

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    app: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    links: Links,
}

impl Resource {
    fn id(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

fn is_success(status: &str) -> bool {
    matches!(status, "success" | "successful" | "deployed" | "live")
}

fn is_failure(status: &str) -> bool {
    matches!(status, "failed" | "error" | "cancelled")
}

pub struct CustomDeployer {
    settings: CustomDeploySection,
    client: reqwest::Client,
}

impl CustomDeployer {
    pub fn new(settings: CustomDeploySection) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.settings.api_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.settings.api_token)
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .with_context(|| format!("Failed to reach deployer for {}", what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Deployer {} returned {}: {}", what, status, body);
        }
        Ok(response)
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<Resource> {
        self.send(builder, what)
            .await?
            .json()
            .await
            .with_context(|| format!("Invalid response from deployer for {}", what))
    }

    async fn deploy(&self, target: &DeployTarget, log: &mut CommandLog) -> Option<(String, Option<String>)> {
        let work = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                log.fail("Failed to create work directory", e);
                return None;
            }
        };
        let repo = work.path().join("repo");
        let repo_str = repo.to_string_lossy().to_string();
        if !log
            .run("git", &["clone", &target.git_url, &repo_str], None)
            .await
        {
            log.fail("Failed to clone Git repo", &target.git_url);
            return None;
        }
        let commit = log.capture("git", &["rev-parse", "HEAD"], Some(&repo)).await?;

        match self.upload_and_wait(target, &repo, log).await {
            Ok(app_url) => Some((commit, app_url)),
            Err(e) => {
                log.fail("Deployment failed", format!("{:#}", e));
                None
            }
        }
    }

    async fn upload_and_wait(
        &self,
        target: &DeployTarget,
        repo: &std::path::Path,
        log: &mut CommandLog,
    ) -> Result<Option<String>> {
        let payload = git::archive_zip(repo).await?;
        let app = self
            .send_json(
                self.client
                    .post(self.url("/apps"))
                    .json(&json!({"user": target.username, "project": target.project_name})),
                "app creation",
            )
            .await?;
        let app_id = app.id();

        let deployment = self
            .send_json(
                self.client
                    .post(self.url(&format!("/apps/{}/deployments", app_id)))
                    .header(reqwest::header::CONTENT_TYPE, "application/zip")
                    .body(payload),
                "upload",
            )
            .await?;
        let number = deployment.id();
        log.line(format!("Uploaded deployment {} of app {}", number, app_id));

        let status_path = format!("/apps/{}/deployments/{}", app_id, number);
        let interval = Duration::from_secs(self.settings.poll_interval_secs);
        let mut last = deployment;
        let mut attempts = 0;
        loop {
            let status = last.status.clone().unwrap_or_default();
            if is_success(&status) || is_failure(&status) {
                break;
            }
            if attempts >= self.settings.poll_attempts {
                self.append_logs(&status_path, log).await;
                anyhow::bail!(
                    "Deployment {} still {} after {} attempts",
                    number,
                    status,
                    attempts
                );
            }
            attempts += 1;
            tokio::time::sleep(interval).await;
            last = self
                .send_json(self.client.get(self.url(&status_path)), "status")
                .await?;
        }

        self.append_logs(&status_path, log).await;
        let status = last.status.unwrap_or_default();
        if is_failure(&status) {
            anyhow::bail!("Deployment {} ended with status {}", number, status);
        }
        Ok(last.links.app.or(app.links.app))
    }

    async fn append_logs(&self, status_path: &str, log: &mut CommandLog) {
        let path = format!("{}/logs", status_path);
        match self.send(self.client.get(self.url(&path)), "logs").await {
            Ok(response) => match response.text().await {
                Ok(text) => log.line(text),
                Err(e) => log.line(format!("Failed to read deployment logs: {}", e)),
            },
            Err(e) => log.line(format!("{:#}", e)),
        }
    }
}

#[async_trait]
impl Deployer for CustomDeployer {
    fn kind(&self) -> DeployerKind {
        DeployerKind::Custom
    }

    async fn run(&self, target: &DeployTarget) -> DeployResult {
        let span = logging::deploy_span("custom", &target.username, &target.project_name);
        async {
            let mut log = CommandLog::new();
            match self.deploy(target, &mut log).await {
                Some((commit, app_url)) => DeployResult {
                    ok: true,
                    logs: log.into_string(),
                    app_url,
                    git_commit_hash: Some(commit),
                },
                None => {
                    tracing::warn!("Deployment failed");
                    DeployResult::failed(log.into_string())
                }
            }
        }
        .instrument(span)
        .await
    }
}
