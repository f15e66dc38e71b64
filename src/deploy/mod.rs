//! Deployment backends for learner apps.
//!
//! A [`Deployer`] takes a learner's repo to a running app. Failures never
//! escape as errors: every outcome is a [`DeployResult`] whose `logs` end up
//! verbatim in the changelog.

pub mod command;
pub mod custom;
pub mod nomad;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::models::{DeployerKind, UserProjectContext};

pub use command::CommandLog;
pub use custom::CustomDeployer;
pub use nomad::{NomadClient, NomadDeployer, Scheduler};

/// What to deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployTarget {
    pub site_name: String,
    pub username: String,
    pub project_name: String,
    pub git_url: String,
}

impl DeployTarget {
    pub fn from_context(ctx: &UserProjectContext) -> Self {
        Self {
            site_name: ctx.site.name.clone(),
            username: ctx.user.username.clone(),
            project_name: ctx.project.name.clone(),
            git_url: ctx.user_project.git_url.clone(),
        }
    }

    /// Scheduler service and job name.
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.username, self.project_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub ok: bool,
    pub logs: String,
    /// Only set when `ok`.
    pub app_url: Option<String>,
    pub git_commit_hash: Option<String>,
}

impl DeployResult {
    pub fn failed(logs: impl Into<String>) -> Self {
        Self {
            ok: false,
            logs: logs.into(),
            app_url: None,
            git_commit_hash: None,
        }
    }
}

#[async_trait]
pub trait Deployer: Send + Sync {
    fn kind(&self) -> DeployerKind;

    async fn run(&self, target: &DeployTarget) -> DeployResult;
}
