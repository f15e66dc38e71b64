//! The user-project lifecycle: provisioning, the push-triggered
//! deploy/check pipeline, and project metadata sync.
//!
//! [`Orchestrator`] is built once at process start and passed explicitly to
//! the HTTP handlers and the queue worker. It owns every external client, so
//! tests swap in fakes through [`OrchestratorBuilder`].

pub mod jobs;
pub mod provision;
pub mod sync;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::checker::{CheckRequest, CheckerRunner, ContainerChecker, ProcessChecker};
use crate::config::{CapstoneConfig, CheckerMode};
use crate::deploy::{CustomDeployer, Deployer, NomadDeployer};
use crate::queue::{FileQueue, JobQueue, JobRegistry, Worker};
use crate::repo_provider::{GittoClient, RepoProvider};
use crate::store::db::{CapstoneDb, DbHandle};
use crate::store::models::{
    Changelog, ChangelogEntry, DeployerKind, Project, RunDetails, UserProjectContext,
};

pub use jobs::{UPDATE_PROJECT_JOB, UPDATE_USER_PROJECT_JOB};
pub use provision::{GitSeeder, NoopSeeder, StarterSeeder};

pub struct Orchestrator {
    pub config: CapstoneConfig,
    pub db: DbHandle,
    pub queue: Arc<dyn JobQueue>,
    pub repo_provider: Arc<dyn RepoProvider>,
    pub checker: Arc<dyn CheckerRunner>,
    pub seeder: Arc<dyn StarterSeeder>,
    deployers: HashMap<DeployerKind, Arc<dyn Deployer>>,
    jobs: Arc<JobRegistry<Orchestrator>>,
    locks: ProvisionLocks,
}

impl Orchestrator {
    /// Production wiring from configuration.
    pub fn from_config(config: CapstoneConfig) -> Result<Self> {
        let db = CapstoneDb::new(&config.database.path)
            .context("Failed to initialize Capstone database")?;
        let remote = (!config.checker.remote_checks_url.is_empty())
            .then(|| config.checker.remote_checks_url.clone());
        let checker: Arc<dyn CheckerRunner> = match config.checker.mode {
            CheckerMode::Container => Arc::new(ContainerChecker::new(&config.checker.image, remote)?),
            CheckerMode::Process if config.checker.program.is_empty() => {
                Arc::new(ProcessChecker::current_exe(remote)?)
            }
            CheckerMode::Process => Arc::new(ProcessChecker::new(
                config.checker.program.clone().into(),
                remote,
            )),
        };

        OrchestratorBuilder::new(config.clone(), DbHandle::new(db))
            .queue(Arc::new(FileQueue::new(&config.queue.dir)))
            .repo_provider(Arc::new(GittoClient::new(
                &config.repo_provider.base_url,
                &config.repo_provider.api_token,
            )))
            .deployer(Arc::new(NomadDeployer::new(config.deploy.nomad.clone())))
            .deployer(Arc::new(CustomDeployer::new(config.deploy.custom.clone())))
            .checker(checker)
            .seeder(Arc::new(GitSeeder))
            .build()
    }

    /// The backend a project deploys with.
    pub fn deployer_for(&self, project: &Project) -> Result<Arc<dyn Deployer>> {
        let kind = project.deployer.unwrap_or(self.config.deploy.default);
        self.deployers
            .get(&kind)
            .cloned()
            .with_context(|| format!("No {} deployer configured", kind.as_str()))
    }

    pub fn worker(self: &Arc<Self>) -> Worker<Orchestrator> {
        Worker::new(
            self.clone(),
            self.queue.clone(),
            self.jobs.clone(),
            Duration::from_secs(self.config.queue.poll_interval_secs),
        )
    }

    fn public_url(&self) -> &str {
        self.config.server.public_url.trim_end_matches('/')
    }

    pub fn user_project_webhook_url(&self, username: &str, project: &str, repo_id: &str) -> String {
        format!(
            "{}/api/users/{}/projects/{}/hook/{}",
            self.public_url(),
            username,
            project,
            repo_id
        )
    }

    pub fn project_webhook_url(&self, project: &str, repo_id: &str) -> String {
        format!("{}/api/projects/{}/hook/{}", self.public_url(), project, repo_id)
    }

    pub fn check_request(&self, ctx: &UserProjectContext) -> CheckRequest {
        CheckRequest {
            capstone_url: self.public_url().to_string(),
            capstone_token: self.config.server.api_token.clone(),
            project_name: ctx.project.name.clone(),
            username: ctx.user.username.clone(),
        }
    }

    /// Record a pending run for a learner push and queue its pipeline job.
    pub async fn enqueue_user_project_update(&self, ctx: &UserProjectContext) -> Result<Changelog> {
        let (site_id, project_id, user_id) = (ctx.site.id, ctx.project.id, ctx.user.id);
        let changelog = self
            .db
            .call(move |db| {
                db.add_changelog(
                    site_id,
                    Some(project_id),
                    Some(user_id),
                    &ChangelogEntry::UpdateUserProject(RunDetails::pending()),
                )
            })
            .await?;
        let kwargs = json!({"changelog_id": changelog.id, "user_project_id": ctx.user_project.id});
        self.enqueue(UPDATE_USER_PROJECT_JOB, kwargs, changelog).await
    }

    /// Record a pending metadata sync and queue it.
    pub async fn enqueue_project_update(&self, project: &Project) -> Result<Changelog> {
        let (site_id, project_id) = (project.site_id, project.id);
        let changelog = self
            .db
            .call(move |db| {
                db.add_changelog(
                    site_id,
                    Some(project_id),
                    None,
                    &ChangelogEntry::UpdateProject(RunDetails::pending()),
                )
            })
            .await?;
        let kwargs = json!({"changelog_id": changelog.id, "project_id": project.id});
        self.enqueue(UPDATE_PROJECT_JOB, kwargs, changelog).await
    }

    async fn enqueue(
        &self,
        job: &str,
        kwargs: serde_json::Value,
        changelog: Changelog,
    ) -> Result<Changelog> {
        match self.queue.add(job, kwargs) {
            Ok(record) => {
                tracing::info!(job, key = %record.key, changelog_id = changelog.id, "Queued pipeline run");
                Ok(changelog)
            }
            Err(e) => {
                let message = format!("Failed to queue job: {}", e);
                let mut entry = changelog.entry.clone();
                if let ChangelogEntry::UpdateUserProject(details) | ChangelogEntry::UpdateProject(details) =
                    &mut entry
                {
                    details.status = crate::store::models::RunStatus::Failed;
                    details.log = message.clone();
                }
                let id = changelog.id;
                if let Err(update) = self.db.call(move |db| db.update_changelog(id, &entry)).await {
                    tracing::error!(error = %format!("{:#}", update), "Failed to record queue failure");
                }
                Err(anyhow::anyhow!(message))
            }
        }
    }
}

/// Assembles an [`Orchestrator`] from its parts.
pub struct OrchestratorBuilder {
    config: CapstoneConfig,
    db: DbHandle,
    queue: Option<Arc<dyn JobQueue>>,
    repo_provider: Option<Arc<dyn RepoProvider>>,
    checker: Option<Arc<dyn CheckerRunner>>,
    seeder: Option<Arc<dyn StarterSeeder>>,
    deployers: HashMap<DeployerKind, Arc<dyn Deployer>>,
}

impl OrchestratorBuilder {
    pub fn new(config: CapstoneConfig, db: DbHandle) -> Self {
        Self {
            config,
            db,
            queue: None,
            repo_provider: None,
            checker: None,
            seeder: None,
            deployers: HashMap::new(),
        }
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn repo_provider(mut self, provider: Arc<dyn RepoProvider>) -> Self {
        self.repo_provider = Some(provider);
        self
    }

    /// Register a deployment backend under its own kind.
    pub fn deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployers.insert(deployer.kind(), deployer);
        self
    }

    pub fn checker(mut self, checker: Arc<dyn CheckerRunner>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn seeder(mut self, seeder: Arc<dyn StarterSeeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        Ok(Orchestrator {
            queue: self.queue.context("Orchestrator needs a job queue")?,
            repo_provider: self
                .repo_provider
                .context("Orchestrator needs a repo provider")?,
            checker: self.checker.context("Orchestrator needs a checker")?,
            seeder: self.seeder.unwrap_or_else(|| Arc::new(NoopSeeder)),
            deployers: self.deployers,
            jobs: Arc::new(jobs::registry()),
            locks: ProvisionLocks::default(),
            config: self.config,
            db: self.db,
        })
    }
}

/// One async mutex per provisioning key, so concurrent starts of the same
/// user project inside this process run one after the other.
///
/// An entry referenced only by the map is idle and gets dropped on the next
/// `lock`, so the map holds at most the keys in use plus one.
#[derive(Default)]
struct ProvisionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProvisionLocks {
    async fn lock(&self, key: String) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .map_err(|e| anyhow::anyhow!("Provision lock poisoned: {}", e))?;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}
