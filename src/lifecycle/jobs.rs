//! Background jobs run by the queue worker.
//!
//! `update_user_project` is the push pipeline: deploy, run the checker,
//! reconcile task status. `update_project` re-reads a project's task list.
//! Both keep their changelog row current as they go, ending in `success`
//! or `failed` with the cumulative log.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::Orchestrator;
use crate::deploy::DeployTarget;
use crate::queue::{JobHandler, JobRegistry};
use crate::store::db::DbHandle;
use crate::store::models::{
    ChangelogEntry, DeployDetails, PipelineStage, RunDetails, RunStatus, TaskStatus,
};

pub const UPDATE_USER_PROJECT_JOB: &str = "update_user_project";
pub const UPDATE_PROJECT_JOB: &str = "update_project";

/// Every job the worker knows about.
pub fn registry() -> JobRegistry<Orchestrator> {
    let mut jobs = JobRegistry::new();
    jobs.register(UPDATE_USER_PROJECT_JOB, UpdateUserProject);
    jobs.register(UPDATE_PROJECT_JOB, UpdateProject);
    jobs
}

#[derive(Debug, Deserialize)]
struct UpdateUserProjectArgs {
    changelog_id: i64,
    user_project_id: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateProjectArgs {
    changelog_id: i64,
    project_id: i64,
}

pub struct UpdateUserProject;

#[async_trait]
impl JobHandler<Orchestrator> for UpdateUserProject {
    async fn run(&self, orch: &Orchestrator, kwargs: &Value) -> Result<()> {
        let args: UpdateUserProjectArgs = serde_json::from_value(kwargs.clone())
            .context("Invalid update_user_project arguments")?;
        orch.update_user_project(args.changelog_id, args.user_project_id)
            .await
    }
}

pub struct UpdateProject;

#[async_trait]
impl JobHandler<Orchestrator> for UpdateProject {
    async fn run(&self, orch: &Orchestrator, kwargs: &Value) -> Result<()> {
        let args: UpdateProjectArgs =
            serde_json::from_value(kwargs.clone()).context("Invalid update_project arguments")?;
        orch.update_project(args.changelog_id, args.project_id).await
    }
}

/// The changelog row of one run, rewritten at every stage change.
struct RunLog {
    changelog_id: i64,
    wrap: fn(RunDetails) -> ChangelogEntry,
    details: RunDetails,
}

impl RunLog {
    fn new(changelog_id: i64, wrap: fn(RunDetails) -> ChangelogEntry) -> Self {
        Self {
            changelog_id,
            wrap,
            details: RunDetails::pending(),
        }
    }

    async fn stage(&mut self, db: &DbHandle, stage: PipelineStage) -> Result<()> {
        self.details.status = RunStatus::Running;
        self.details.stage = stage;
        tracing::info!(changelog_id = self.changelog_id, stage = ?stage, "Pipeline stage");
        self.save(db).await
    }

    async fn save(&self, db: &DbHandle) -> Result<()> {
        let id = self.changelog_id;
        let entry = (self.wrap)(self.details.clone());
        db.call(move |db| db.update_changelog(id, &entry).map(|_| ()))
            .await
    }

    /// Record the final status. A pipeline error is appended to the log and
    /// handed back so the job lands in `failed`.
    async fn finish(&mut self, db: &DbHandle, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => {
                self.details.status = RunStatus::Success;
                self.details.stage = PipelineStage::Done;
            }
            Err(e) => {
                self.details.status = RunStatus::Failed;
                if !self.details.log.is_empty() && !self.details.log.ends_with('\n') {
                    self.details.log.push('\n');
                }
                self.details.log.push_str(&format!("{:#}\n", e));
            }
        }
        if let Err(e) = self.save(db).await {
            tracing::error!(
                changelog_id = self.changelog_id,
                error = %format!("{:#}", e),
                "Failed to record run outcome"
            );
            return result.and(Err(e));
        }
        result
    }
}

impl Orchestrator {
    /// Deploy a learner's latest push, check it and reconcile their task
    /// status. Task status is only touched when both deploy and checker
    /// run succeed.
    pub async fn update_user_project(&self, changelog_id: i64, user_project_id: i64) -> Result<()> {
        let mut run = RunLog::new(changelog_id, ChangelogEntry::UpdateUserProject);
        let result = self.user_project_pipeline(&mut run, user_project_id).await;
        run.finish(&self.db, result).await
    }

    async fn user_project_pipeline(&self, run: &mut RunLog, user_project_id: i64) -> Result<()> {
        run.stage(&self.db, PipelineStage::Deploy).await?;
        let ctx = self
            .db
            .call(move |db| db.get_user_project_context_by_id(user_project_id))
            .await?
            .ok_or_else(|| anyhow!("User project {} not found", user_project_id))?;

        let deployer = self.deployer_for(&ctx.project)?;
        let target = DeployTarget::from_context(&ctx);
        let deployed = deployer.run(&target).await;
        run.details.log.push_str(&deployed.logs);
        run.details.git_commit_hash = deployed.git_commit_hash.clone();
        if !deployed.ok {
            tracing::warn!(user_project_id, "Deployment failed");
            return Err(anyhow!("Deployment failed"));
        }

        let entry = ChangelogEntry::Deploy(DeployDetails {
            deployer: deployer.kind(),
            git_commit_hash: deployed.git_commit_hash.clone(),
            app_url: deployed.app_url.clone(),
        });
        let mut settings = ctx.user_project.app_settings.clone();
        if deployed.app_url.is_some() {
            settings.app_url = deployed.app_url.clone();
        }
        let (site_id, project_id, user_id) = (ctx.site.id, ctx.project.id, ctx.user.id);
        self.db
            .call(move |db| {
                db.add_changelog(site_id, Some(project_id), Some(user_id), &entry)?;
                db.update_app_settings(user_project_id, &settings)
            })
            .await?;

        run.stage(&self.db, PipelineStage::Checks).await?;
        let output = self.checker.run(&self.check_request(&ctx)).await;
        run.details.log.push_str(&output.log);
        if !output.ok {
            tracing::warn!(user_project_id, "Checker run failed");
            return Err(anyhow!("Checker run failed"));
        }

        let outcomes = output.tasks;
        let progress = self
            .db
            .call(move |db| db.reconcile(user_project_id, &outcomes))
            .await?;
        let current = progress
            .iter()
            .find(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.name.as_str())
            .unwrap_or("-");
        tracing::info!(user_project_id, current_task = current, "Reconciled task status");
        Ok(())
    }

    /// Re-read a project's `capstone.yml` and apply its task list.
    pub async fn update_project(&self, changelog_id: i64, project_id: i64) -> Result<()> {
        let mut run = RunLog::new(changelog_id, ChangelogEntry::UpdateProject);
        let result = self.project_pipeline(&mut run, project_id).await;
        run.finish(&self.db, result).await
    }

    async fn project_pipeline(&self, run: &mut RunLog, project_id: i64) -> Result<()> {
        run.stage(&self.db, PipelineStage::Sync).await?;
        let project = self
            .db
            .call(move |db| db.get_project_by_id(project_id))
            .await?
            .ok_or_else(|| anyhow!("Project {} not found", project_id))?;
        self.sync_project(&project, &mut run.details.log).await?;
        Ok(())
    }
}
