//! Cluster deployer: docker image build + Nomad service job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use minijinja::Environment;
use serde_json::{Value, json};
use tracing::Instrument;

use super::{CommandLog, DeployResult, DeployTarget, Deployer};
use crate::config::NomadSection;
use crate::logging;
use crate::store::models::DeployerKind;

const JOB_TEMPLATE: &str = r#"
job "{{ name }}" {
  type = "service"

  group "{{ name }}" {
    count = 1

    network {
      port "web" {
        to = 8080
      }
    }

    service {
      name = "{{ name }}"
      port = "web"
      tags = ["capstone-service"]

      meta {
        host = "{{ host }}"
      }
    }

    task "{{ name }}" {
      driver = "docker"

      config {
        image      = "{{ docker_image }}"
        force_pull = true
        ports      = ["web"]
      }

      resources {
        cpu    = 100
        memory = 128
      }
    }
  }
}
"#;

/// Render the HCL job specification for one learner app.
pub fn render_job(name: &str, host: &str, docker_image: &str) -> Result<String> {
    Environment::new()
        .render_str(
            JOB_TEMPLATE,
            json!({"name": name, "host": host, "docker_image": docker_image}),
        )
        .context("Failed to render Nomad job template")
}

/// The cluster scheduler, as far as deployment needs it.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submit an HCL job. Returns the job id.
    async fn submit(&self, job_hcl: &str) -> Result<String>;

    /// Status of the job's latest deployment, `None` before one exists.
    async fn deployment_status(&self, job_id: &str) -> Result<Option<String>>;
}

/// Nomad HTTP API client.
pub struct NomadClient {
    addr: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl NomadClient {
    pub fn new(addr: &str, token: &str) -> Self {
        Self {
            addr: addr.trim_end_matches('/').to_string(),
            token: (!token.is_empty()).then(|| token.to_string()),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.addr, path));
        match &self.token {
            Some(token) => builder.header("X-Nomad-Token", token),
            None => builder,
        }
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach Nomad for {}", what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Nomad {} returned {}: {}", what, status, body);
        }
        response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from Nomad {}", what))
    }
}

#[async_trait]
impl Scheduler for NomadClient {
    async fn submit(&self, job_hcl: &str) -> Result<String> {
        let parse = self
            .request(reqwest::Method::POST, "/v1/jobs/parse")
            .json(&json!({"JobHCL": job_hcl, "Canonicalize": true}));
        let job = self.send_json(parse, "job parse").await?;
        let job_id = job
            .get("ID")
            .and_then(Value::as_str)
            .context("Parsed Nomad job has no ID")?
            .to_string();

        let register = self
            .request(reqwest::Method::POST, "/v1/jobs")
            .json(&json!({"Job": job}));
        let response = self.send_json(register, "job register").await?;
        tracing::debug!(job_id = %job_id, eval_id = ?response.get("EvalID"), "Registered Nomad job");
        Ok(job_id)
    }

    async fn deployment_status(&self, job_id: &str) -> Result<Option<String>> {
        let get = self.request(
            reqwest::Method::GET,
            &format!("/v1/job/{}/deployment", job_id),
        );
        let deployment = self.send_json(get, "deployment lookup").await?;
        Ok(deployment
            .get("Status")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// Clone → build → push → submit → health poll.
pub struct NomadDeployer {
    settings: NomadSection,
    scheduler: Arc<dyn Scheduler>,
    docker: String,
}

impl NomadDeployer {
    pub fn new(settings: NomadSection) -> Self {
        let scheduler = Arc::new(NomadClient::new(&settings.addr, &settings.token));
        Self::with_scheduler(settings, scheduler)
    }

    pub fn with_scheduler(settings: NomadSection, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            settings,
            scheduler,
            docker: "docker".to_string(),
        }
    }

    /// Use another executable in place of `docker`.
    pub fn with_docker_program(mut self, program: impl Into<String>) -> Self {
        self.docker = program.into();
        self
    }

    pub fn hostname(&self, target: &DeployTarget) -> String {
        self.settings
            .app_url_hostname_template
            .replace("{username}", &target.username)
            .replace("{project_name}", &target.project_name)
            .replace("{site_name}", &target.site_name)
    }

    pub fn app_url(&self, target: &DeployTarget) -> String {
        let mut url = format!("{}://{}", self.settings.app_url_scheme, self.hostname(target));
        if self.settings.app_url_port != 0 {
            url.push_str(&format!(":{}", self.settings.app_url_port));
        }
        url
    }

    pub fn image_tag(&self, target: &DeployTarget) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}/{}-{}-{}:{}",
            self.settings.registry,
            target.site_name,
            target.username,
            target.project_name,
            &suffix[..10]
        )
    }

    async fn deploy(&self, target: &DeployTarget, log: &mut CommandLog) -> Option<String> {
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

        if !repo.join("Dockerfile").is_file() {
            log.fail("Failed to build docker image", "No Dockerfile found in the repository");
            return None;
        }
        let image = self.image_tag(target);
        if !log
            .run(&self.docker, &["build", "-t", &image, "."], Some(&repo))
            .await
        {
            log.fail("Failed to build docker image", &image);
            return None;
        }
        if !log.run(&self.docker, &["push", &image], Some(&repo)).await {
            log.fail("Failed to push docker image", &image);
            return None;
        }

        let job_hcl = match render_job(&target.service_name(), &self.hostname(target), &image) {
            Ok(hcl) => hcl,
            Err(e) => {
                log.fail("Failed to deploy to Nomad", format!("{:#}", e));
                return None;
            }
        };
        let job_id = match self.scheduler.submit(&job_hcl).await {
            Ok(id) => id,
            Err(e) => {
                log.fail("Failed to deploy to Nomad", format!("{:#}", e));
                return None;
            }
        };
        log.line(format!("Submitted job {}", job_id));

        if let Err(message) = self.wait_healthy(&job_id, log).await {
            log.fail("App health check failed", message);
            return None;
        }
        Some(commit)
    }

    async fn wait_healthy(&self, job_id: &str, log: &mut CommandLog) -> Result<(), String> {
        let timeout = Duration::from_secs(self.settings.health_timeout_secs);
        let interval = Duration::from_secs(self.settings.health_interval_secs);
        let start = Instant::now();
        loop {
            let status = self
                .scheduler
                .deployment_status(job_id)
                .await
                .map_err(|e| format!("{:#}", e))?;
            let status = status.unwrap_or_else(|| "pending".to_string());
            match status.as_str() {
                "successful" => return Ok(()),
                "failed" | "cancelled" => {
                    return Err(format!("Deployment of {} ended with status {}", job_id, status));
                }
                _ => {}
            }
            if start.elapsed() >= timeout {
                return Err(format!(
                    "Timeout after {} seconds. Job status: {}",
                    timeout.as_secs(),
                    status
                ));
            }
            log.line(format!(
                "Waiting for job to start. Current status: {}. Will check again in {} seconds.",
                status,
                interval.as_secs()
            ));
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl Deployer for NomadDeployer {
    fn kind(&self) -> DeployerKind {
        DeployerKind::Nomad
    }

    async fn run(&self, target: &DeployTarget) -> DeployResult {
        let span = logging::deploy_span("nomad", &target.username, &target.project_name);
        async {
            let mut log = CommandLog::new();
            match self.deploy(target, &mut log).await {
                Some(commit) => {
                    tracing::info!(commit = %commit, "Deployment healthy");
                    DeployResult {
                        ok: true,
                        logs: log.into_string(),
                        app_url: Some(self.app_url(target)),
                        git_commit_hash: Some(commit),
                    }
                }
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
