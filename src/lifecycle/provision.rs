//! Creating and removing repos for projects and learners.
//!
//! Any failure after a repo was created deletes the repo again, together
//! with the database row if it got as far as being inserted.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::Instrument;

use super::Orchestrator;
use crate::errors::{CapstoneError, RepoProviderError};
use crate::git;
use crate::logging;
use crate::store::models::{NewProject, Project, Site, User, UserProject, UserProjectContext};

/// Directory of a project repo holding the learner's starter code.
pub const STARTER_DIR: &str = "repo";

/// Fills a freshly created learner repo with starter code.
#[async_trait]
pub trait StarterSeeder: Send + Sync {
    async fn seed(&self, project: &Project, user: &User, git_url: &str) -> Result<()>;
}

/// Leaves new repos empty.
pub struct NoopSeeder;

#[async_trait]
impl StarterSeeder for NoopSeeder {
    async fn seed(&self, _project: &Project, _user: &User, _git_url: &str) -> Result<()> {
        Ok(())
    }
}

/// Copies the project's `repo/` directory into the learner repo, adds a
/// README when there is none, and pushes one "Initial commit" to `main`.
pub struct GitSeeder;

#[async_trait]
impl StarterSeeder for GitSeeder {
    async fn seed(&self, project: &Project, user: &User, git_url: &str) -> Result<()> {
        let work = tempfile::tempdir().context("Failed to create seed directory")?;
        let learner = work.path().join("learner");
        git::clone(git_url, &learner).await?;

        if let Some(project_url) = &project.git_url {
            let template = work.path().join("project");
            git::clone(project_url, &template).await?;
            let starter = template.join(STARTER_DIR);
            if starter.is_dir() {
                copy_tree(&starter, &learner)?;
            }
        }
        let readme = learner.join("README.md");
        if !readme.exists() {
            std::fs::write(&readme, format!("# {}\n\n{}'s work on {}.\n", project.title, user.username, project.name))
                .context("Failed to write README")?;
        }
        if git::commit_all(&learner, "Initial commit").await? {
            git::push(&learner, "main").await?;
        }
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry.context("Failed to walk starter directory")?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("Starter file outside starter directory")?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", rel.display()))?;
        }
    }
    Ok(())
}

impl Orchestrator {
    /// Sign a learner up for a project: repo, row, starter code, webhook.
    pub async fn start_user_project(&self, user: &User, project: &Project) -> Result<UserProject> {
        if user.site_id != project.site_id {
            return Err(CapstoneError::SiteMismatch.into());
        }
        let span = logging::provision_span("start", &user.username, &project.name);
        self.start_locked(user, project).instrument(span).await
    }

    async fn start_locked(&self, user: &User, project: &Project) -> Result<UserProject> {
        let _guard = self
            .locks
            .lock(format!("user_project:{}:{}", user.id, project.id))
            .await?;

        let (user_id, project_id) = (user.id, project.id);
        let existing = self
            .db
            .call(move |db| db.get_user_project(user_id, project_id))
            .await?;
        if existing.is_some() {
            return Err(CapstoneError::AlreadyStarted {
                username: user.username.clone(),
                project: project.name.clone(),
            }
            .into());
        }

        let repo_id = self
            .repo_provider
            .create_repo(&format!("{}-{}", user.username, project.name))
            .await
            .map_err(CapstoneError::from)?;

        let mut inserted = None;
        let result = self
            .finish_start(user, project, &repo_id, &mut inserted)
            .await;
        if result.is_err() {
            self.roll_back(&repo_id, inserted).await;
        }
        result
    }

    async fn finish_start(
        &self,
        user: &User,
        project: &Project,
        repo_id: &str,
        inserted: &mut Option<i64>,
    ) -> Result<UserProject> {
        let repo = self
            .repo_provider
            .get_repo(repo_id)
            .await
            .map_err(CapstoneError::from)?;

        let (u, p, id, url) = (user.clone(), project.clone(), repo_id.to_string(), repo.git_url.clone());
        let user_project = self
            .db
            .call(move |db| db.create_user_project(&u, &p, &id, &url))
            .await?;
        *inserted = Some(user_project.id);

        self.seeder
            .seed(project, user, &user_project.git_url)
            .await
            .context("Failed to seed starter code")?;

        let hook = self.user_project_webhook_url(&user.username, &project.name, repo_id);
        self.repo_provider
            .set_webhook(repo_id, &hook)
            .await
            .map_err(CapstoneError::from)?;
        tracing::info!(user_project_id = user_project.id, repo_id, "Started user project");
        Ok(user_project)
    }

    async fn roll_back(&self, repo_id: &str, row: Option<i64>) {
        tracing::warn!(repo_id, "Provisioning failed, rolling back");
        if let Err(e) = self.repo_provider.delete_repo(repo_id).await {
            tracing::error!(repo_id, error = %e, "Failed to delete repo during rollback");
        }
        if let Some(id) = row {
            if let Err(e) = self.db.call(move |db| db.delete_user_project(id)).await {
                tracing::error!(user_project_id = id, error = %format!("{:#}", e), "Failed to delete row during rollback");
            }
        }
    }

    /// Delete the learner's repo, then the user project (statuses cascade).
    /// A repo the provider no longer knows is not an error.
    pub async fn delete_user_project(&self, ctx: &UserProjectContext) -> Result<()> {
        let span = logging::provision_span("delete", &ctx.user.username, &ctx.project.name);
        self.delete_locked(ctx).instrument(span).await
    }

    async fn delete_locked(&self, ctx: &UserProjectContext) -> Result<()> {
        let _guard = self
            .locks
            .lock(format!("user_project:{}:{}", ctx.user.id, ctx.project.id))
            .await?;
        match self.repo_provider.delete_repo(&ctx.user_project.repo_id).await {
            Ok(()) | Err(RepoProviderError::Status { status: 404, .. }) => {}
            Err(e) => return Err(CapstoneError::from(e).into()),
        }
        let id = ctx.user_project.id;
        self.db.call(move |db| db.delete_user_project(id)).await?;
        tracing::info!(user_project_id = id, "Deleted user project");
        Ok(())
    }

    /// Create a project with its own content repo and sync webhook.
    pub async fn create_project(&self, site: &Site, new: &NewProject) -> Result<Project> {
        let span = logging::provision_span("create_project", &site.name, &new.name);
        self.create_project_locked(site, new).instrument(span).await
    }

    async fn create_project_locked(&self, site: &Site, new: &NewProject) -> Result<Project> {
        let _guard = self
            .locks
            .lock(format!("project:{}:{}", site.id, new.name))
            .await?;
        let (site_id, name) = (site.id, new.name.clone());
        if self.db.call(move |db| db.get_project(site_id, &name)).await?.is_some() {
            return Err(CapstoneError::AlreadyExists {
                name: new.name.clone(),
            }
            .into());
        }

        let repo_id = self
            .repo_provider
            .create_repo(&format!("capstone-{}", new.name))
            .await
            .map_err(CapstoneError::from)?;

        let mut inserted = None;
        let result = self
            .finish_create_project(site, new, &repo_id, &mut inserted)
            .await;
        if result.is_err() {
            tracing::warn!(repo_id = %repo_id, "Project creation failed, rolling back");
            if let Err(e) = self.repo_provider.delete_repo(&repo_id).await {
                tracing::error!(repo_id = %repo_id, error = %e, "Failed to delete repo during rollback");
            }
            if let Some(id) = inserted {
                if let Err(e) = self.db.call(move |db| db.delete_project(id)).await {
                    tracing::error!(project_id = id, error = %format!("{:#}", e), "Failed to delete project during rollback");
                }
            }
        }
        result
    }

    async fn finish_create_project(
        &self,
        site: &Site,
        new: &NewProject,
        repo_id: &str,
        inserted: &mut Option<i64>,
    ) -> Result<Project> {
        let repo = self
            .repo_provider
            .get_repo(repo_id)
            .await
            .map_err(CapstoneError::from)?;
        let (site_id, new_project) = (site.id, new.clone());
        let project = self
            .db
            .call(move |db| db.create_project(site_id, &new_project))
            .await?;
        *inserted = Some(project.id);

        let (project_id, id, url) = (project.id, repo_id.to_string(), repo.git_url.clone());
        let project = self
            .db
            .call(move |db| db.set_project_repo(project_id, &id, &url))
            .await?;

        let hook = self.project_webhook_url(&project.name, repo_id);
        self.repo_provider
            .set_webhook(repo_id, &hook)
            .await
            .map_err(CapstoneError::from)?;
        tracing::info!(project_id = project.id, repo_id, "Created project");
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::store::models::TaskStatus;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_start_user_project_provisions_everything() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let (_site, user, project) = seed_project(&orch);

        let up = orch.start_user_project(&user, &project).await.unwrap();
        assert_eq!(up.git_url, format!("https://git.test/{}.git", up.repo_id));
        assert_eq!(
            provider.repos.lock().unwrap()[&up.repo_id].as_deref(),
            Some(format!("http://capstone.test/api/users/alice/projects/p/hook/{}", up.repo_id).as_str())
        );

        let progress = orch.db.lock_sync().unwrap().get_task_progress(up.id).unwrap();
        let statuses: Vec<_> = progress.iter().map(|t| t.status).collect();
        assert_eq!(statuses, [TaskStatus::InProgress, TaskStatus::Pending]);
    }

    #[tokio::test]
    async fn test_second_start_is_conflict_and_creates_no_repo() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let (_site, user, project) = seed_project(&orch);

        orch.start_user_project(&user, &project).await.unwrap();
        let err = orch.start_user_project(&user, &project).await.unwrap_err();
        let err = err.downcast_ref::<CapstoneError>().unwrap();
        assert!(err.is_conflict());
        assert_eq!(provider.repos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_one_repo() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = Arc::new(orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![])));
        let (_site, user, project) = seed_project(&orch);

        let (a, b) = tokio::join!(
            orch.start_user_project(&user, &project),
            orch.start_user_project(&user, &project)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(provider.repos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_after_repo_creation_deletes_repo() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider {
            fail_get: true,
            ..Default::default()
        });
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let (_site, user, project) = seed_project(&orch);

        let err = orch.start_user_project(&user, &project).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstoneError>(),
            Some(CapstoneError::RepoProvider(RepoProviderError::Status { status: 500, .. }))
        ));
        assert!(provider.repos.lock().unwrap().is_empty());
        assert!(
            orch.db
                .lock_sync()
                .unwrap()
                .get_user_project(user.id, project.id)
                .unwrap()
                .is_none()
        );
    }

    struct BrokenSeeder;

    #[async_trait]
    impl StarterSeeder for BrokenSeeder {
        async fn seed(&self, _project: &Project, _user: &User, _git_url: &str) -> Result<()> {
            anyhow::bail!("push rejected")
        }
    }

    fn assert_not_started(orch: &Orchestrator, provider: &FakeRepoProvider, user: &User, project: &Project) {
        assert!(provider.repos.lock().unwrap().is_empty());
        assert!(
            orch.db
                .lock_sync()
                .unwrap()
                .get_user_project(user.id, project.id)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_insert_failure_deletes_repo() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let (_site, user, project) = seed_project(&orch);
        orch.db
            .lock_sync()
            .unwrap()
            .conn()
            .execute_batch(
                "CREATE TRIGGER no_user_projects BEFORE INSERT ON user_project
                 BEGIN SELECT RAISE(ABORT, 'db down'); END;",
            )
            .unwrap();

        let err = orch.start_user_project(&user, &project).await.unwrap_err();
        assert!(format!("{:#}", err).contains("db down"));
        assert_not_started(&orch, &provider, &user, &project);
    }

    #[tokio::test]
    async fn test_seed_failure_removes_repo_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let mut orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        orch.seeder = Arc::new(BrokenSeeder);
        let (_site, user, project) = seed_project(&orch);

        let err = orch.start_user_project(&user, &project).await.unwrap_err();
        assert!(format!("{:#}", err).contains("push rejected"));
        assert_not_started(&orch, &provider, &user, &project);
    }

    #[tokio::test]
    async fn test_webhook_failure_removes_repo_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider {
            fail_webhook: true,
            ..Default::default()
        });
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let (_site, user, project) = seed_project(&orch);

        let err = orch.start_user_project(&user, &project).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstoneError>(),
            Some(CapstoneError::RepoProvider(RepoProviderError::Status { status: 502, .. }))
        ));
        assert_not_started(&orch, &provider, &user, &project);
    }

    #[tokio::test]
    async fn test_create_project_insert_failure_deletes_repo() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let site = {
            let db = orch.db.lock_sync().unwrap();
            let site = db.create_site("pipal", "pipal.test").unwrap();
            db.conn()
                .execute_batch(
                    "CREATE TRIGGER no_projects BEFORE INSERT ON project
                     BEGIN SELECT RAISE(ABORT, 'db down'); END;",
                )
                .unwrap();
            site
        };
        let new = NewProject {
            name: "blog".to_string(),
            title: "Blog".to_string(),
            ..Default::default()
        };

        let err = orch.create_project(&site, &new).await.unwrap_err();
        assert!(format!("{:#}", err).contains("db down"));
        assert!(provider.repos.lock().unwrap().is_empty());
        assert!(orch.db.lock_sync().unwrap().get_project(site.id, "blog").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_project_webhook_failure_removes_project() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider {
            fail_webhook: true,
            ..Default::default()
        });
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let site = orch.db.lock_sync().unwrap().create_site("pipal", "pipal.test").unwrap();
        let new = NewProject {
            name: "blog".to_string(),
            title: "Blog".to_string(),
            ..Default::default()
        };

        orch.create_project(&site, &new).await.unwrap_err();
        assert!(provider.repos.lock().unwrap().is_empty());
        assert!(orch.db.lock_sync().unwrap().get_project(site.id, "blog").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_site_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Arc::default(), deployed(), checked(vec![]));
        let (_site, _user, project) = seed_project(&orch);
        let stranger = {
            let db = orch.db.lock_sync().unwrap();
            let other = db.create_site("other", "other.test").unwrap();
            db.create_user(other.id, "bob", "bob@example.com", "Bob").unwrap()
        };
        let err = orch.start_user_project(&stranger, &project).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CapstoneError>(), Some(CapstoneError::SiteMismatch)));
    }

    #[tokio::test]
    async fn test_delete_user_project_removes_repo_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let (site, user, project) = seed_project(&orch);
        orch.start_user_project(&user, &project).await.unwrap();

        let ctx = orch
            .db
            .lock_sync()
            .unwrap()
            .get_user_project_context(site.id, "alice", "p")
            .unwrap()
            .unwrap();
        orch.delete_user_project(&ctx).await.unwrap();
        assert!(provider.repos.lock().unwrap().is_empty());
        assert!(orch.db.lock_sync().unwrap().get_task_progress(ctx.user_project.id).unwrap().is_empty());

        // The repo is already gone on a second attempt.
        orch.delete_user_project(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_project_sets_repo_and_hook() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeRepoProvider::default());
        let orch = orchestrator(dir.path(), provider.clone(), deployed(), checked(vec![]));
        let site = orch.db.lock_sync().unwrap().create_site("pipal", "pipal.test").unwrap();
        let new = NewProject {
            name: "blog".to_string(),
            title: "Blog".to_string(),
            ..Default::default()
        };

        let project = orch.create_project(&site, &new).await.unwrap();
        let repo_id = project.repo_id.clone().unwrap();
        assert_eq!(project.git_url.as_deref(), Some(format!("https://git.test/{}.git", repo_id).as_str()));
        assert_eq!(
            provider.repos.lock().unwrap()[&repo_id].as_deref(),
            Some(format!("http://capstone.test/api/projects/blog/hook/{}", repo_id).as_str())
        );

        let err = orch.create_project(&site, &new).await.unwrap_err();
        assert!(err.downcast_ref::<CapstoneError>().unwrap().is_conflict());
        assert_eq!(provider.repos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_git_seeder_pushes_starter_code() -> Result<()> {
        if !git::available().await {
            return Ok(());
        }
        let dir = tempfile::tempdir()?;
        let template = dir.path().join("template.git");
        git::testing::bare_repo_with(
            &template,
            &[("capstone.yml", "tasks: []\n"), ("repo/app.py", "print('hello')\n")],
        )
        .await?;
        let learner = dir.path().join("learner.git");
        git::testing::empty_bare_repo(&learner).await?;

        let project = Project {
            id: 1,
            site_id: 1,
            name: "p".to_string(),
            title: "P".to_string(),
            short_description: String::new(),
            description: String::new(),
            tags: vec![],
            is_published: true,
            repo_id: None,
            git_url: Some(template.to_string_lossy().to_string()),
            deployer: None,
            created_at: String::new(),
        };
        let user = User {
            id: 1,
            site_id: 1,
            username: "alice".to_string(),
            email: String::new(),
            full_name: String::new(),
            created_at: String::new(),
        };
        GitSeeder.seed(&project, &user, learner.to_str().unwrap()).await?;

        let check = dir.path().join("check");
        git::clone(learner.to_str().unwrap(), &check).await?;
        assert!(check.join("app.py").is_file());
        assert!(check.join("README.md").is_file());
        assert!(!check.join("capstone.yml").exists());
        Ok(())
    }
}
