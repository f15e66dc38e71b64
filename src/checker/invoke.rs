//! Launching the checker from the worker.
//!
//! Check code comes from project authors, so in production it runs in a
//! throwaway container that only shares an output directory with the host.
//! Development setups run the same `run-checks` command as a child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, WaitContainerOptions,
};
use futures::StreamExt;

use super::CheckerOutput;
use super::runner::read_output;

/// Result file name inside the shared output directory.
pub const RESULT_FILE: &str = "result.json";
/// Mount point of the output directory inside the checker container.
const CONTAINER_OUTPUT_DIR: &str = "/output";

/// Who to check, and where the checker can reach the Capstone API.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub capstone_url: String,
    pub capstone_token: String,
    pub project_name: String,
    pub username: String,
}

impl CheckRequest {
    /// `run-checks` arguments, writing the result to `output`.
    pub fn command_args(&self, output: &str, remote_checks_url: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "run-checks".to_string(),
            "--capstone-url".to_string(),
            self.capstone_url.clone(),
            "--capstone-token".to_string(),
            self.capstone_token.clone(),
            "--project-name".to_string(),
            self.project_name.clone(),
            "--username".to_string(),
            self.username.clone(),
            "--output".to_string(),
            output.to_string(),
        ];
        if let Some(url) = remote_checks_url {
            args.push("--remote-checks-url".to_string());
            args.push(url.to_string());
        }
        args
    }
}

/// Runs the checker for one learner. Never fails; problems come back as
/// `ok: false` output.
#[async_trait]
pub trait CheckerRunner: Send + Sync {
    async fn run(&self, request: &CheckRequest) -> CheckerOutput;
}

/// Dev mode: `run-checks` as a direct child process.
pub struct ProcessChecker {
    program: PathBuf,
    remote_checks_url: Option<String>,
}

impl ProcessChecker {
    pub fn new(program: PathBuf, remote_checks_url: Option<String>) -> Self {
        Self {
            program,
            remote_checks_url,
        }
    }

    /// Use the running executable as the checker program.
    pub fn current_exe(remote_checks_url: Option<String>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(program, remote_checks_url))
    }

    async fn try_run(&self, request: &CheckRequest, out_dir: &Path) -> Result<(String, PathBuf)> {
        let result_path = out_dir.join(RESULT_FILE);
        let result_str = result_path
            .to_str()
            .context("Output path is not valid UTF-8")?;
        let output = tokio::process::Command::new(&self.program)
            .args(request.command_args(result_str, self.remote_checks_url.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to start checker {}", self.program.display()))?;
        let mut log = String::from_utf8_lossy(&output.stdout).to_string();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((log, result_path))
    }
}

#[async_trait]
impl CheckerRunner for ProcessChecker {
    async fn run(&self, request: &CheckRequest) -> CheckerOutput {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => return CheckerOutput::failed(format!("Failed to create output dir: {}", e)),
        };
        match self.try_run(request, dir.path()).await {
            Ok((log, path)) => collect(&path, log),
            Err(e) => CheckerOutput::failed(format!("{:#}", e)),
        }
    }
}

/// Production mode: `run-checks` inside a fresh container with host
/// networking and the output directory bind-mounted.
pub struct ContainerChecker {
    docker: Docker,
    image: String,
    remote_checks_url: Option<String>,
}

impl ContainerChecker {
    pub fn new(image: impl Into<String>, remote_checks_url: Option<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self {
            docker,
            image: image.into(),
            remote_checks_url,
        })
    }

    async fn try_run(&self, request: &CheckRequest, out_dir: &Path) -> Result<String> {
        let name = format!(
            "capstone-check-{}-{}",
            request.username,
            uuid::Uuid::new_v4().simple()
        );
        let output_file = format!("{}/{}", CONTAINER_OUTPUT_DIR, RESULT_FILE);
        let mut cmd = vec!["capstone".to_string()];
        cmd.extend(request.command_args(&output_file, self.remote_checks_url.as_deref()));

        let body = ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(cmd),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}",
                    out_dir.display(),
                    CONTAINER_OUTPUT_DIR
                )]),
                network_mode: Some("host".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        let container = self
            .docker
            .create_container(Some(options), body)
            .await
            .context("Failed to create checker container")?;

        let result = self.run_container(&container.id).await;

        let remove = RemoveContainerOptionsBuilder::default().force(true).build();
        if let Err(e) = self.docker.remove_container(&container.id, Some(remove)).await {
            tracing::warn!(container = %container.id, error = %e, "Failed to remove checker container");
        }
        result
    }

    async fn run_container(&self, id: &str) -> Result<String> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .context("Failed to start checker container")?;

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        while let Some(status) = wait.next().await {
            // A non-zero exit surfaces as an error here; the result file
            // still decides the outcome.
            if let Err(e) = status {
                tracing::debug!(container = %id, error = %e, "Checker container exited with error");
            }
        }

        let options = LogsOptionsBuilder::default().stdout(true).stderr(true).build();
        let mut logs = self.docker.logs(id, Some(options));
        let mut log = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(output) => log.push_str(&output.to_string()),
                Err(e) => {
                    tracing::warn!(container = %id, error = %e, "Failed to read checker logs");
                    break;
                }
            }
        }
        Ok(log)
    }
}

#[async_trait]
impl CheckerRunner for ContainerChecker {
    async fn run(&self, request: &CheckRequest) -> CheckerOutput {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => return CheckerOutput::failed(format!("Failed to create output dir: {}", e)),
        };
        match self.try_run(request, dir.path()).await {
            Ok(log) => collect(&dir.path().join(RESULT_FILE), log),
            Err(e) => CheckerOutput::failed(format!("{:#}", e)),
        }
    }
}

/// Read the result file; fall back to the captured process log when it is
/// missing or malformed.
fn collect(result_path: &Path, process_log: String) -> CheckerOutput {
    match read_output(result_path) {
        Ok(output) => output,
        Err(e) => CheckerOutput::failed(format!("{}{:#}", process_log, e)),
    }
}
