use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::checker::TaskOutcome;
use crate::errors::CapstoneError;
use crate::reconciler;

/// Async-safe handle to the Capstone database.
///
/// Wraps `CapstoneDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CapstoneDb>>,
}

impl DbHandle {
    pub fn new(db: CapstoneDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CapstoneDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI admin
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CapstoneDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct CapstoneDb {
    conn: Connection,
}

impl CapstoneDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Raw connection, for tests that need to inject schema faults.
    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS site (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    domain TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS user_account (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL REFERENCES site(id) ON DELETE CASCADE,
                    username TEXT NOT NULL,
                    email TEXT NOT NULL DEFAULT '',
                    full_name TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(site_id, username)
                );

                CREATE TABLE IF NOT EXISTS project (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL REFERENCES site(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    short_description TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    tags TEXT NOT NULL DEFAULT '[]',
                    is_published INTEGER NOT NULL DEFAULT 0,
                    repo_id TEXT,
                    git_url TEXT,
                    deployer TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(site_id, name)
                );

                CREATE TABLE IF NOT EXISTS task (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES project(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    position INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(project_id, name)
                );

                CREATE TABLE IF NOT EXISTS task_check (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    args TEXT NOT NULL DEFAULT '{}',
                    position INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS user_project (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES user_account(id) ON DELETE CASCADE,
                    project_id INTEGER NOT NULL REFERENCES project(id) ON DELETE CASCADE,
                    repo_id TEXT NOT NULL,
                    git_url TEXT NOT NULL,
                    app_settings TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(user_id, project_id)
                );

                CREATE TABLE IF NOT EXISTS user_task_status (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_project_id INTEGER NOT NULL REFERENCES user_project(id) ON DELETE CASCADE,
                    task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'Pending',
                    UNIQUE(user_project_id, task_id)
                );

                CREATE TABLE IF NOT EXISTS user_check_status (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_task_status_id INTEGER NOT NULL REFERENCES user_task_status(id) ON DELETE CASCADE,
                    check_id INTEGER NOT NULL REFERENCES task_check(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    message TEXT,
                    UNIQUE(user_task_status_id, check_id)
                );

                CREATE TABLE IF NOT EXISTS changelog (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL REFERENCES site(id) ON DELETE CASCADE,
                    project_id INTEGER REFERENCES project(id) ON DELETE SET NULL,
                    user_id INTEGER REFERENCES user_account(id) ON DELETE SET NULL,
                    action TEXT NOT NULL,
                    details TEXT NOT NULL DEFAULT '{}',
                    timestamp TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_task_project ON task(project_id);
                CREATE INDEX IF NOT EXISTS idx_task_check_task ON task_check(task_id);
                CREATE INDEX IF NOT EXISTS idx_user_task_status_up ON user_task_status(user_project_id);
                CREATE INDEX IF NOT EXISTS idx_changelog_scope ON changelog(site_id, project_id, user_id, action);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Sites ─────────────────────────────────────────────────────────

    pub fn create_site(&self, name: &str, domain: &str) -> Result<Site> {
        self.conn
            .execute(
                "INSERT INTO site (name, domain) VALUES (?1, ?2)",
                params![name, domain],
            )
            .context("Failed to insert site")?;
        let id = self.conn.last_insert_rowid();
        self.get_site_by_id(id)?.context("Site not found after insert")
    }

    pub fn get_site(&self, name: &str) -> Result<Option<Site>> {
        self.conn
            .query_row(
                "SELECT id, name, domain, created_at FROM site WHERE name = ?1",
                params![name],
                site_from_row,
            )
            .optional()
            .context("Failed to query site")
    }

    pub fn get_site_by_id(&self, id: i64) -> Result<Option<Site>> {
        self.conn
            .query_row(
                "SELECT id, name, domain, created_at FROM site WHERE id = ?1",
                params![id],
                site_from_row,
            )
            .optional()
            .context("Failed to query site")
    }

    pub fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>> {
        self.conn
            .query_row(
                "SELECT id, name, domain, created_at FROM site WHERE domain = ?1",
                params![domain],
                site_from_row,
            )
            .optional()
            .context("Failed to query site by domain")
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        site_id: i64,
        username: &str,
        email: &str,
        full_name: &str,
    ) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO user_account (site_id, username, email, full_name) VALUES (?1, ?2, ?3, ?4)",
                params![site_id, username, email, full_name],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user_by_id(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, site_id: i64, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, site_id, username, email, full_name, created_at
                 FROM user_account WHERE site_id = ?1 AND username = ?2",
                params![site_id, username],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, site_id, username, email, full_name, created_at
                 FROM user_account WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, site_id: i64, new: &NewProject) -> Result<Project> {
        let tags = serde_json::to_string(&new.tags).context("Failed to serialize tags")?;
        let result = self.conn.execute(
            "INSERT INTO project (site_id, name, title, short_description, description, tags, is_published, deployer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                site_id,
                new.name,
                new.title,
                new.short_description,
                new.description,
                tags,
                new.is_published,
                new.deployer.map(|d| d.as_str()),
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(CapstoneError::AlreadyExists {
                    name: new.name.clone(),
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert project")),
        }
        let id = self.conn.last_insert_rowid();
        self.get_project_by_id(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, site_id: i64, name: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM project WHERE site_id = ?1 AND name = ?2", PROJECT_COLUMNS),
                params![site_id, name],
                project_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub fn get_project_by_id(&self, id: i64) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM project WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                project_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub fn list_projects(&self, site_id: i64) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM project WHERE site_id = ?1 ORDER BY name",
                PROJECT_COLUMNS
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![site_id], project_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn set_project_repo(&self, id: i64, repo_id: &str, git_url: &str) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE project SET repo_id = ?1, git_url = ?2 WHERE id = ?3",
                params![repo_id, git_url, id],
            )
            .context("Failed to update project repo")?;
        self.get_project_by_id(id)?
            .context("Project not found after repo update")
    }

    pub fn set_project_deployer(&self, id: i64, deployer: Option<DeployerKind>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE project SET deployer = ?1 WHERE id = ?2",
                params![deployer.map(|d| d.as_str()), id],
            )
            .context("Failed to update project deployer")?;
        Ok(())
    }

    /// Delete a project. Cascades to tasks, checks and every user project.
    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM project WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(n > 0)
    }

    /// Project with ordered tasks and checks, the shape the checker consumes.
    pub fn get_project_detail(&self, project_id: i64) -> Result<Option<ProjectDetail>> {
        let Some(project) = self.get_project_by_id(project_id)? else {
            return Ok(None);
        };
        let mut tasks = Vec::new();
        for task in self.get_tasks(project_id)? {
            let checks = self
                .get_checks(task.id)?
                .into_iter()
                .map(|c| CheckDetail {
                    name: c.name,
                    title: c.title,
                    args: c.args,
                })
                .collect();
            tasks.push(TaskDetail {
                name: task.name,
                title: task.title,
                description: task.description,
                checks,
            });
        }
        Ok(Some(ProjectDetail {
            name: project.name,
            title: project.title,
            git_url: project.git_url,
            tasks,
        }))
    }

    // ── Tasks and checks ──────────────────────────────────────────────

    pub fn get_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        load_tasks(&self.conn, project_id)
    }

    /// Replace a project's task list, keyed by task name.
    ///
    /// Existing tasks are updated in place (title, description, position,
    /// checks) so learner statuses survive reordering and edits; tasks missing
    /// from `tasks` are deleted along with their statuses. Every user project
    /// of the project gets its current-task pointer recomputed.
    pub fn update_tasks(&self, project_id: i64, tasks: &[NewTask]) -> Result<Vec<Task>> {
        let mut seen = HashSet::new();
        for task in tasks {
            if !seen.insert(task.name.as_str()) {
                bail!("Duplicate task name: {}", task.name);
            }
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let existing: HashMap<String, i64> = load_tasks(&tx, project_id)?
            .into_iter()
            .map(|t| (t.name, t.id))
            .collect();

        for (position, task) in tasks.iter().enumerate() {
            let task_id = match existing.get(&task.name) {
                Some(&id) => {
                    tx.execute(
                        "UPDATE task SET title = ?1, description = ?2, position = ?3 WHERE id = ?4",
                        params![task.title, task.description, position as i64, id],
                    )
                    .context("Failed to update task")?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO task (project_id, name, title, description, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![project_id, task.name, task.title, task.description, position as i64],
                    )
                    .context("Failed to insert task")?;
                    tx.last_insert_rowid()
                }
            };
            write_checks(&tx, task_id, &task.checks)?;
        }

        for (name, id) in &existing {
            if !seen.contains(name.as_str()) {
                tx.execute("DELETE FROM task WHERE id = ?1", params![id])
                    .context("Failed to delete task")?;
            }
        }

        let mut stmt = tx
            .prepare("SELECT id FROM user_project WHERE project_id = ?1")
            .context("Failed to prepare user project scan")?;
        let user_project_ids = stmt
            .query_map(params![project_id], |row| row.get::<_, i64>(0))
            .context("Failed to query user projects")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read user project row")?;
        drop(stmt);
        for up_id in user_project_ids {
            let mut progress = load_progress(&tx, up_id)?;
            reconciler::assign_in_progress(&mut progress);
            write_progress(&tx, up_id, &progress)?;
        }

        tx.commit().context("Failed to commit task update")?;
        self.get_tasks(project_id)
    }

    /// Replace a task's checks. Identity is `(name, args)`: matching checks
    /// keep their id (and learner results), the rest are deleted or inserted.
    pub fn update_checks(&self, task_id: i64, checks: &[NewCheck]) -> Result<Vec<TaskCheck>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        write_checks(&tx, task_id, checks)?;
        tx.commit().context("Failed to commit check update")?;
        self.get_checks(task_id)
    }

    pub fn get_checks(&self, task_id: i64) -> Result<Vec<TaskCheck>> {
        load_checks(&self.conn, task_id)
    }

    pub fn delete_task(&self, task_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM task WHERE id = ?1", params![task_id])
            .context("Failed to delete task")?;
        Ok(n > 0)
    }

    // ── User projects ─────────────────────────────────────────────────

    /// Insert a user project with one status row per task, the first task
    /// `In Progress`. A second start for the same pair is `AlreadyStarted`.
    pub fn create_user_project(
        &self,
        user: &User,
        project: &Project,
        repo_id: &str,
        git_url: &str,
    ) -> Result<UserProject> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let result = tx.execute(
            "INSERT INTO user_project (user_id, project_id, repo_id, git_url) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, project.id, repo_id, git_url],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(CapstoneError::AlreadyStarted {
                    username: user.username.clone(),
                    project: project.name.clone(),
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert user project")),
        }
        let id = tx.last_insert_rowid();
        let mut progress = load_progress(&tx, id)?;
        reconciler::assign_in_progress(&mut progress);
        write_progress(&tx, id, &progress)?;
        tx.commit().context("Failed to commit user project")?;
        self.get_user_project_by_id(id)?
            .context("User project not found after insert")
    }

    pub fn get_user_project(&self, user_id: i64, project_id: i64) -> Result<Option<UserProject>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, project_id, repo_id, git_url, app_settings, created_at
                 FROM user_project WHERE user_id = ?1 AND project_id = ?2",
                params![user_id, project_id],
                user_project_row,
            )
            .optional()
            .context("Failed to query user project")?;
        row.map(UserProjectRow::into_user_project).transpose()
    }

    pub fn get_user_project_by_id(&self, id: i64) -> Result<Option<UserProject>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, project_id, repo_id, git_url, app_settings, created_at
                 FROM user_project WHERE id = ?1",
                params![id],
                user_project_row,
            )
            .optional()
            .context("Failed to query user project")?;
        row.map(UserProjectRow::into_user_project).transpose()
    }

    /// Resolve site, user, project and user project by names.
    pub fn get_user_project_context(
        &self,
        site_id: i64,
        username: &str,
        project_name: &str,
    ) -> Result<Option<UserProjectContext>> {
        let Some(site) = self.get_site_by_id(site_id)? else {
            return Ok(None);
        };
        let Some(user) = self.get_user(site_id, username)? else {
            return Ok(None);
        };
        let Some(project) = self.get_project(site_id, project_name)? else {
            return Ok(None);
        };
        let Some(user_project) = self.get_user_project(user.id, project.id)? else {
            return Ok(None);
        };
        Ok(Some(UserProjectContext {
            site,
            user,
            project,
            user_project,
        }))
    }

    pub fn get_user_project_context_by_id(&self, id: i64) -> Result<Option<UserProjectContext>> {
        let Some(user_project) = self.get_user_project_by_id(id)? else {
            return Ok(None);
        };
        let user = self
            .get_user_by_id(user_project.user_id)?
            .context("User project references a missing user")?;
        let project = self
            .get_project_by_id(user_project.project_id)?
            .context("User project references a missing project")?;
        let site = self
            .get_site_by_id(project.site_id)?
            .context("Project references a missing site")?;
        Ok(Some(UserProjectContext {
            site,
            user,
            project,
            user_project,
        }))
    }

    pub fn update_app_settings(&self, id: i64, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings).context("Failed to serialize app settings")?;
        self.conn
            .execute(
                "UPDATE user_project SET app_settings = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to update app settings")?;
        Ok(())
    }

    /// Delete a user project. Cascades to task and check statuses.
    pub fn delete_user_project(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM user_project WHERE id = ?1", params![id])
            .context("Failed to delete user project")?;
        Ok(n > 0)
    }

    pub fn get_task_progress(&self, user_project_id: i64) -> Result<Vec<TaskProgress>> {
        load_progress(&self.conn, user_project_id)
    }

    /// Record one checker run and recompute the current task, atomically.
    pub fn reconcile(
        &self,
        user_project_id: i64,
        outcomes: &[TaskOutcome],
    ) -> Result<Vec<TaskProgress>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut progress = load_progress(&tx, user_project_id)?;
        reconciler::apply_run(&mut progress, outcomes);
        write_progress(&tx, user_project_id, &progress)?;
        tx.commit().context("Failed to commit reconciliation")?;
        Ok(progress)
    }

    // ── Changelog ─────────────────────────────────────────────────────

    pub fn add_changelog(
        &self,
        site_id: i64,
        project_id: Option<i64>,
        user_id: Option<i64>,
        entry: &ChangelogEntry,
    ) -> Result<Changelog> {
        let details = details_json(entry)?;
        self.conn
            .execute(
                "INSERT INTO changelog (site_id, project_id, user_id, action, details) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![site_id, project_id, user_id, entry.action(), details],
            )
            .context("Failed to insert changelog")?;
        let id = self.conn.last_insert_rowid();
        self.get_changelog(id)?
            .context("Changelog not found after insert")
    }

    /// Overwrite the details of a changelog row. The action must not change.
    pub fn update_changelog(&self, id: i64, entry: &ChangelogEntry) -> Result<Changelog> {
        let details = details_json(entry)?;
        let n = self
            .conn
            .execute(
                "UPDATE changelog SET details = ?1 WHERE id = ?2 AND action = ?3",
                params![details, id, entry.action()],
            )
            .context("Failed to update changelog")?;
        if n == 0 {
            return Err(CapstoneError::ChangelogNotFound { id }.into());
        }
        self.get_changelog(id)?
            .context("Changelog not found after update")
    }

    pub fn get_changelog(&self, id: i64) -> Result<Option<Changelog>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, site_id, project_id, user_id, action, details, timestamp
                 FROM changelog WHERE id = ?1",
                params![id],
                changelog_row,
            )
            .optional()
            .context("Failed to query changelog")?;
        row.map(ChangelogRow::into_changelog).transpose()
    }

    /// Run history of one learner's project, newest first.
    pub fn user_project_history(&self, user_id: i64, project_id: i64) -> Result<Vec<HistoryItem>> {
        self.history(
            "SELECT id, site_id, project_id, user_id, action, details, timestamp FROM changelog
             WHERE user_id = ?1 AND project_id = ?2 AND action = 'update_user_project'
             ORDER BY id DESC",
            params![user_id, project_id],
        )
    }

    /// Metadata sync history of a project, newest first.
    pub fn project_history(&self, project_id: i64) -> Result<Vec<HistoryItem>> {
        self.history(
            "SELECT id, site_id, project_id, user_id, action, details, timestamp FROM changelog
             WHERE project_id = ?1 AND action = 'update_project'
             ORDER BY id DESC",
            params![project_id],
        )
    }

    fn history(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<HistoryItem>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare history")?;
        let rows = stmt
            .query_map(params, changelog_row)
            .context("Failed to query history")?;
        let mut items = Vec::new();
        for row in rows {
            let changelog = row.context("Failed to read changelog row")?.into_changelog()?;
            if let Some(details) = changelog.entry.run_details() {
                items.push(HistoryItem {
                    changelog_id: changelog.id,
                    timestamp: changelog.timestamp.clone(),
                    status: details.status,
                    log: details.log.clone(),
                });
            }
        }
        Ok(items)
    }

    /// Deployments across a site, newest first.
    pub fn list_deployments(&self, site_id: i64) -> Result<Vec<DeploymentRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.timestamp, c.details, p.name, u.username
                 FROM changelog c
                 LEFT JOIN project p ON p.id = c.project_id
                 LEFT JOIN user_account u ON u.id = c.user_id
                 WHERE c.site_id = ?1 AND c.action = 'deploy'
                 ORDER BY c.id DESC",
            )
            .context("Failed to prepare list_deployments")?;
        let rows = stmt
            .query_map(params![site_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .context("Failed to query deployments")?;
        let mut records = Vec::new();
        for row in rows {
            let (timestamp, details, project, username) =
                row.context("Failed to read deployment row")?;
            let details: DeployDetails =
                serde_json::from_str(&details).context("Failed to parse deploy details")?;
            records.push(DeploymentRecord {
                timestamp,
                deployer: details.deployer,
                project,
                username,
                git_commit_hash: details.git_commit_hash,
                app_url: details.app_url,
            });
        }
        Ok(records)
    }
}

// ── Transaction-scoped helpers ────────────────────────────────────────
//
// These take a plain `&Connection` so they run unchanged inside a
// `Transaction` (which derefs to one).

fn load_tasks(conn: &Connection, project_id: i64) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, project_id, name, title, description, position
             FROM task WHERE project_id = ?1 ORDER BY position, id",
        )
        .context("Failed to prepare load_tasks")?;
    let rows = stmt
        .query_map(params![project_id], |row| {
            Ok(Task {
                id: row.get(0)?,
                project_id: row.get(1)?,
                name: row.get(2)?,
                title: row.get(3)?,
                description: row.get(4)?,
                position: row.get(5)?,
            })
        })
        .context("Failed to query tasks")?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.context("Failed to read task row")?);
    }
    Ok(tasks)
}

fn load_checks(conn: &Connection, task_id: i64) -> Result<Vec<TaskCheck>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, name, title, args, position
             FROM task_check WHERE task_id = ?1 ORDER BY position, id",
        )
        .context("Failed to prepare load_checks")?;
    let rows = stmt
        .query_map(params![task_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .context("Failed to query checks")?;
    let mut checks = Vec::new();
    for row in rows {
        let (id, task_id, name, title, args, position) =
            row.context("Failed to read check row")?;
        checks.push(TaskCheck {
            id,
            task_id,
            name,
            title,
            args: serde_json::from_str(&args).context("Failed to parse check args JSON")?,
            position,
        });
    }
    Ok(checks)
}

fn write_checks(conn: &Connection, task_id: i64, checks: &[NewCheck]) -> Result<()> {
    // serde_json maps are ordered, so the serialized args are canonical.
    let mut existing: HashMap<(String, String), i64> = HashMap::new();
    for check in load_checks(conn, task_id)? {
        existing.insert((check.name, check.args.to_string()), check.id);
    }

    for (position, check) in checks.iter().enumerate() {
        let args = check.args.to_string();
        match existing.remove(&(check.name.clone(), args.clone())) {
            Some(id) => {
                conn.execute(
                    "UPDATE task_check SET title = ?1, position = ?2 WHERE id = ?3",
                    params![check.title, position as i64, id],
                )
                .context("Failed to update check")?;
            }
            None => {
                conn.execute(
                    "INSERT INTO task_check (task_id, name, title, args, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task_id, check.name, check.title, args, position as i64],
                )
                .context("Failed to insert check")?;
            }
        }
    }

    for id in existing.values() {
        conn.execute("DELETE FROM task_check WHERE id = ?1", params![id])
            .context("Failed to delete check")?;
    }
    Ok(())
}

/// Task and check statuses of a user project in position order. Missing
/// status rows read as `Pending` / `pending`.
fn load_progress(conn: &Connection, user_project_id: i64) -> Result<Vec<TaskProgress>> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.name, t.title, t.position, COALESCE(uts.status, 'Pending')
             FROM user_project up
             JOIN task t ON t.project_id = up.project_id
             LEFT JOIN user_task_status uts
                ON uts.task_id = t.id AND uts.user_project_id = up.id
             WHERE up.id = ?1
             ORDER BY t.position, t.id",
        )
        .context("Failed to prepare load_progress")?;
    let rows = stmt
        .query_map(params![user_project_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .context("Failed to query task progress")?;

    let mut check_stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.title, COALESCE(ucs.status, 'pending'), ucs.message
             FROM task_check c
             LEFT JOIN user_task_status uts
                ON uts.task_id = c.task_id AND uts.user_project_id = ?1
             LEFT JOIN user_check_status ucs
                ON ucs.user_task_status_id = uts.id AND ucs.check_id = c.id
             WHERE c.task_id = ?2
             ORDER BY c.position, c.id",
        )
        .context("Failed to prepare check progress")?;

    let mut progress = Vec::new();
    for row in rows {
        let (task_id, name, title, position, status) =
            row.context("Failed to read task progress row")?;
        let status = TaskStatus::from_str(&status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;

        let check_rows = check_stmt
            .query_map(params![user_project_id, task_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query check progress")?;
        let mut checks = Vec::new();
        for check in check_rows {
            let (check_id, name, title, status, message) =
                check.context("Failed to read check progress row")?;
            checks.push(CheckProgress {
                check_id,
                name,
                title,
                status: CheckStatus::from_str(&status)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse check status")?,
                message,
            });
        }

        progress.push(TaskProgress {
            task_id,
            name,
            title,
            position,
            status,
            checks,
        });
    }
    Ok(progress)
}

fn write_progress(conn: &Connection, user_project_id: i64, progress: &[TaskProgress]) -> Result<()> {
    for task in progress {
        conn.execute(
            "INSERT INTO user_task_status (user_project_id, task_id, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_project_id, task_id) DO UPDATE SET status = excluded.status",
            params![user_project_id, task.task_id, task.status.as_str()],
        )
        .context("Failed to upsert task status")?;
        let status_id: i64 = conn
            .query_row(
                "SELECT id FROM user_task_status WHERE user_project_id = ?1 AND task_id = ?2",
                params![user_project_id, task.task_id],
                |row| row.get(0),
            )
            .context("Failed to read task status id")?;
        for check in &task.checks {
            conn.execute(
                "INSERT INTO user_check_status (user_task_status_id, check_id, status, message) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_task_status_id, check_id)
                 DO UPDATE SET status = excluded.status, message = excluded.message",
                params![status_id, check.check_id, check.status.as_str(), check.message],
            )
            .context("Failed to upsert check status")?;
        }
    }
    Ok(())
}

fn details_json(entry: &ChangelogEntry) -> Result<String> {
    let value = serde_json::to_value(entry).context("Failed to serialize changelog entry")?;
    Ok(value
        .get("details")
        .cloned()
        .unwrap_or(serde_json::Value::Null)
        .to_string())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// ── Internal row helpers ──────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, site_id, name, title, short_description, description, tags, is_published, repo_id, git_url, deployer, created_at";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        site_id: row.get(1)?,
        username: row.get(2)?,
        email: row.get(3)?,
        full_name: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Intermediate row struct for projects before the JSON `tags` and the
/// `deployer` string are parsed.
struct ProjectRow {
    id: i64,
    site_id: i64,
    name: String,
    title: String,
    short_description: String,
    description: String,
    tags: String,
    is_published: bool,
    repo_id: Option<String>,
    git_url: Option<String>,
    deployer: Option<String>,
    created_at: String,
}

fn project_row(row: &Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.get(0)?,
        site_id: row.get(1)?,
        name: row.get(2)?,
        title: row.get(3)?,
        short_description: row.get(4)?,
        description: row.get(5)?,
        tags: row.get(6)?,
        is_published: row.get(7)?,
        repo_id: row.get(8)?,
        git_url: row.get(9)?,
        deployer: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        let tags: Vec<String> =
            serde_json::from_str(&self.tags).context("Failed to parse project tags JSON")?;
        let deployer = self
            .deployer
            .as_deref()
            .map(DeployerKind::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse project deployer")?;
        Ok(Project {
            id: self.id,
            site_id: self.site_id,
            name: self.name,
            title: self.title,
            short_description: self.short_description,
            description: self.description,
            tags,
            is_published: self.is_published,
            repo_id: self.repo_id,
            git_url: self.git_url,
            deployer,
            created_at: self.created_at,
        })
    }
}

struct UserProjectRow {
    id: i64,
    user_id: i64,
    project_id: i64,
    repo_id: String,
    git_url: String,
    app_settings: String,
    created_at: String,
}

fn user_project_row(row: &Row<'_>) -> rusqlite::Result<UserProjectRow> {
    Ok(UserProjectRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_id: row.get(2)?,
        repo_id: row.get(3)?,
        git_url: row.get(4)?,
        app_settings: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl UserProjectRow {
    fn into_user_project(self) -> Result<UserProject> {
        let app_settings: AppSettings = serde_json::from_str(&self.app_settings)
            .context("Failed to parse app settings JSON")?;
        Ok(UserProject {
            id: self.id,
            user_id: self.user_id,
            project_id: self.project_id,
            repo_id: self.repo_id,
            git_url: self.git_url,
            app_settings,
            created_at: self.created_at,
        })
    }
}

struct ChangelogRow {
    id: i64,
    site_id: i64,
    project_id: Option<i64>,
    user_id: Option<i64>,
    action: String,
    details: String,
    timestamp: String,
}

fn changelog_row(row: &Row<'_>) -> rusqlite::Result<ChangelogRow> {
    Ok(ChangelogRow {
        id: row.get(0)?,
        site_id: row.get(1)?,
        project_id: row.get(2)?,
        user_id: row.get(3)?,
        action: row.get(4)?,
        details: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

impl ChangelogRow {
    fn into_changelog(self) -> Result<Changelog> {
        let details: serde_json::Value =
            serde_json::from_str(&self.details).context("Failed to parse changelog details JSON")?;
        let entry: ChangelogEntry =
            serde_json::from_value(serde_json::json!({"action": self.action, "details": details}))
                .with_context(|| format!("Invalid details for changelog action {}", self.action))?;
        Ok(Changelog {
            id: self.id,
            site_id: self.site_id,
            project_id: self.project_id,
            user_id: self.user_id,
            entry,
            timestamp: self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::CheckOutcome;
    use serde_json::json;

    struct Fixture {
        db: CapstoneDb,
        site: Site,
        user: User,
        project: Project,
    }

    fn fixture() -> Result<Fixture> {
        let db = CapstoneDb::new_in_memory()?;
        let site = db.create_site("main", "capstone.test")?;
        let user = db.create_user(site.id, "alice", "alice@example.com", "Alice")?;
        let project = db.create_project(
            site.id,
            &NewProject {
                name: "blog".to_string(),
                title: "Build a blog".to_string(),
                ..Default::default()
            },
        )?;
        Ok(Fixture {
            db,
            site,
            user,
            project,
        })
    }

    fn new_task(name: &str, checks: &[&str]) -> NewTask {
        NewTask {
            name: name.to_string(),
            title: format!("Title of {}", name),
            description: String::new(),
            checks: checks
                .iter()
                .map(|c| NewCheck {
                    name: c.to_string(),
                    title: String::new(),
                    args: json!({}),
                })
                .collect(),
        }
    }

    fn outcome(name: &str, statuses: &[CheckStatus]) -> TaskOutcome {
        TaskOutcome {
            name: name.to_string(),
            checks: statuses
                .iter()
                .map(|s| CheckOutcome {
                    status: *s,
                    message: Some(format!("{:?}", s)),
                })
                .collect(),
        }
    }

    fn count(db: &CapstoneDb, table: &str) -> i64 {
        db.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = CapstoneDb::new_in_memory()?;
        let table_count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('site', 'user_account', 'project', 'task', 'task_check', 'user_project',
              'user_task_status', 'user_check_status', 'changelog')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 9);
        // Re-running migrations is harmless.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_open_file_database_creates_parent_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("capstone.db");
        let db = CapstoneDb::new(&path)?;
        db.create_site("main", "a.test")?;
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_site_lookup_by_domain() -> Result<()> {
        let f = fixture()?;
        let site = f.db.find_site_by_domain("capstone.test")?.unwrap();
        assert_eq!(site, f.site);
        assert!(f.db.find_site_by_domain("other.test")?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_project_is_already_exists() -> Result<()> {
        let f = fixture()?;
        let err = f
            .db
            .create_project(
                f.site.id,
                &NewProject {
                    name: "blog".to_string(),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstoneError>(),
            Some(CapstoneError::AlreadyExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_project_round_trips_tags_and_deployer() -> Result<()> {
        let f = fixture()?;
        let project = f.db.create_project(
            f.site.id,
            &NewProject {
                name: "shop".to_string(),
                title: "Shop".to_string(),
                tags: vec!["flask".to_string(), "sql".to_string()],
                deployer: Some(DeployerKind::Custom),
                ..Default::default()
            },
        )?;
        let loaded = f.db.get_project(f.site.id, "shop")?.unwrap();
        assert_eq!(loaded, project);
        assert_eq!(loaded.tags, vec!["flask", "sql"]);
        assert_eq!(loaded.deployer, Some(DeployerKind::Custom));
        Ok(())
    }

    #[test]
    fn test_update_checks_round_trip() -> Result<()> {
        let f = fixture()?;
        let tasks = f.db.update_tasks(f.project.id, &[new_task("t1", &[])])?;
        let checks = vec![
            NewCheck {
                name: "http_status".to_string(),
                title: "Home page loads".to_string(),
                args: json!({"path": "/", "status": 200}),
            },
            NewCheck {
                name: "file_exists".to_string(),
                title: "Has README".to_string(),
                args: json!({"path": "README.md"}),
            },
        ];
        f.db.update_checks(tasks[0].id, &checks)?;
        let stored = f.db.get_checks(tasks[0].id)?;
        assert_eq!(stored.len(), 2);
        for (i, (stored, wanted)) in stored.iter().zip(&checks).enumerate() {
            assert_eq!(stored.name, wanted.name);
            assert_eq!(stored.title, wanted.title);
            assert_eq!(stored.args, wanted.args);
            assert_eq!(stored.position, i as i64);
        }
        Ok(())
    }

    #[test]
    fn test_update_checks_keeps_identity_by_name_and_args() -> Result<()> {
        let f = fixture()?;
        let tasks = f.db.update_tasks(f.project.id, &[new_task("t1", &["a", "b"])])?;
        let before = f.db.get_checks(tasks[0].id)?;

        let renamed = vec![
            NewCheck {
                name: "b".to_string(),
                title: "B first".to_string(),
                args: json!({}),
            },
            NewCheck {
                name: "a".to_string(),
                title: String::new(),
                args: json!({"changed": true}),
            },
        ];
        let after = f.db.update_checks(tasks[0].id, &renamed)?;
        assert_eq!(after[0].id, before[1].id, "b keeps its id");
        assert_eq!(after[0].title, "B first");
        assert_ne!(after[1].id, before[0].id, "a with new args is a new check");
        assert_eq!(count(&f.db, "task_check"), 2);
        Ok(())
    }

    #[test]
    fn test_update_tasks_rejects_duplicate_names() -> Result<()> {
        let f = fixture()?;
        let result = f
            .db
            .update_tasks(f.project.id, &[new_task("t1", &[]), new_task("t1", &[])]);
        assert!(result.is_err());
        assert!(f.db.get_tasks(f.project.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_start_sets_first_task_in_progress() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(f.project.id, &[new_task("t1", &["c"]), new_task("t2", &["c"])])?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        let progress = f.db.get_task_progress(up.id)?;
        assert_eq!(progress[0].status, TaskStatus::InProgress);
        assert_eq!(progress[1].status, TaskStatus::Pending);
        assert_eq!(count(&f.db, "user_task_status"), 2);
        Ok(())
    }

    #[test]
    fn test_second_start_is_already_started() -> Result<()> {
        let f = fixture()?;
        f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        let err = f
            .db
            .create_user_project(&f.user, &f.project, "repo-2", "git://y")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstoneError>(),
            Some(CapstoneError::AlreadyStarted { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reconcile_records_checks_and_moves_pointer() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(f.project.id, &[new_task("t1", &[]), new_task("t2", &["always_fail"])])?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;

        let progress = f.db.reconcile(up.id, &[outcome("t1", &[])])?;
        assert_eq!(progress[0].status, TaskStatus::Completed);
        assert_eq!(progress[1].status, TaskStatus::InProgress);

        f.db.reconcile(up.id, &[outcome("t1", &[]), outcome("t2", &[CheckStatus::Fail])])?;
        let stored = f.db.get_task_progress(up.id)?;
        assert_eq!(stored[1].status, TaskStatus::InProgress);
        assert_eq!(stored[1].checks[0].status, CheckStatus::Fail);
        assert_eq!(stored[1].checks[0].message.as_deref(), Some("Fail"));
        assert_eq!(
            reconciler::compute_status(stored[1].checks.iter().map(|c| &c.status)),
            TaskStatus::Failing
        );
        Ok(())
    }

    #[test]
    fn test_reorder_keeps_learner_statuses() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(
            f.project.id,
            &[new_task("a", &["ca"]), new_task("b", &["cb"]), new_task("c", &["cc"])],
        )?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        f.db.reconcile(
            up.id,
            &[outcome("a", &[CheckStatus::Pass]), outcome("b", &[CheckStatus::Fail])],
        )?;

        // Move a after b and retitle c.
        let mut c = new_task("c", &["cc"]);
        c.title = "New title".to_string();
        f.db.update_tasks(f.project.id, &[new_task("b", &["cb"]), new_task("a", &["ca"]), c])?;

        let progress = f.db.get_task_progress(up.id)?;
        let by_name: HashMap<_, _> = progress.iter().map(|t| (t.name.as_str(), t)).collect();
        assert_eq!(progress[0].name, "b");
        assert_eq!(progress[2].title, "New title");
        assert_eq!(by_name["a"].status, TaskStatus::Completed);
        assert_eq!(by_name["a"].checks[0].status, CheckStatus::Pass);
        assert_eq!(by_name["b"].checks[0].status, CheckStatus::Fail);
        assert_eq!(reconciler::in_progress_count(&progress), 1);
        Ok(())
    }

    #[test]
    fn test_deleting_task_cascades() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(f.project.id, &[new_task("t1", &["c1"]), new_task("t2", &["c2"])])?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        f.db.reconcile(up.id, &[outcome("t1", &[CheckStatus::Pass])])?;
        assert_eq!(count(&f.db, "user_check_status"), 2);

        let tasks = f.db.update_tasks(f.project.id, &[new_task("t2", &["c2"])])?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(count(&f.db, "task_check"), 1);
        assert_eq!(count(&f.db, "user_task_status"), 1);
        assert_eq!(count(&f.db, "user_check_status"), 1);
        // The only remaining task becomes current.
        let progress = f.db.get_task_progress(up.id)?;
        assert_eq!(progress[0].status, TaskStatus::InProgress);
        Ok(())
    }

    #[test]
    fn test_delete_task_directly_cascades() -> Result<()> {
        let f = fixture()?;
        let tasks = f.db.update_tasks(f.project.id, &[new_task("t1", &["c1"])])?;
        f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        assert!(f.db.delete_task(tasks[0].id)?);
        assert_eq!(count(&f.db, "task_check"), 0);
        assert_eq!(count(&f.db, "user_task_status"), 0);
        Ok(())
    }

    #[test]
    fn test_deleting_user_project_cascades() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(f.project.id, &[new_task("t1", &["c1"])])?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        f.db.reconcile(up.id, &[outcome("t1", &[CheckStatus::Pass])])?;
        assert!(f.db.delete_user_project(up.id)?);
        assert_eq!(count(&f.db, "user_task_status"), 0);
        assert_eq!(count(&f.db, "user_check_status"), 0);
        assert!(f.db.get_user_project(f.user.id, f.project.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_new_task_after_completion_becomes_current() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(f.project.id, &[new_task("t1", &[])])?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        let progress = f.db.reconcile(up.id, &[outcome("t1", &[])])?;
        assert_eq!(reconciler::in_progress_count(&progress), 0);

        f.db.update_tasks(f.project.id, &[new_task("t1", &[]), new_task("t2", &["c"])])?;
        let progress = f.db.get_task_progress(up.id)?;
        assert_eq!(progress[0].status, TaskStatus::Completed);
        assert_eq!(progress[1].status, TaskStatus::InProgress);
        Ok(())
    }

    #[test]
    fn test_user_project_context_and_app_settings() -> Result<()> {
        let f = fixture()?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        let mut settings = up.app_settings.clone();
        settings.app_url = Some("http://alice-blog.main.local".to_string());
        f.db.update_app_settings(up.id, &settings)?;

        let ctx = f.db.get_user_project_context(f.site.id, "alice", "blog")?.unwrap();
        assert_eq!(ctx.user_project.app_settings.app_url, settings.app_url);
        assert_eq!(ctx.site.name, "main");
        assert!(f.db.get_user_project_context(f.site.id, "bob", "blog")?.is_none());
        assert_eq!(f.db.get_user_project_context_by_id(up.id)?.unwrap(), ctx);
        Ok(())
    }

    #[test]
    fn test_changelog_lifecycle_and_history() -> Result<()> {
        let f = fixture()?;
        let entry = ChangelogEntry::UpdateUserProject(RunDetails::pending());
        let log = f.db.add_changelog(f.site.id, Some(f.project.id), Some(f.user.id), &entry)?;
        assert_eq!(log.entry, entry);

        let done = ChangelogEntry::UpdateUserProject(RunDetails {
            status: RunStatus::Failed,
            stage: PipelineStage::Deploy,
            log: "build failed".to_string(),
            git_commit_hash: None,
        });
        f.db.update_changelog(log.id, &done)?;

        let history = f.db.user_project_history(f.user.id, f.project.id)?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Failed);
        assert_eq!(history[0].log, "build failed");
        assert!(f.db.project_history(f.project.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_changelog_cannot_change_action() -> Result<()> {
        let f = fixture()?;
        let log = f.db.add_changelog(
            f.site.id,
            Some(f.project.id),
            None,
            &ChangelogEntry::UpdateProject(RunDetails::pending()),
        )?;
        let err = f
            .db
            .update_changelog(log.id, &ChangelogEntry::UpdateUserProject(RunDetails::pending()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstoneError>(),
            Some(CapstoneError::ChangelogNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_list_deployments() -> Result<()> {
        let f = fixture()?;
        f.db.add_changelog(
            f.site.id,
            Some(f.project.id),
            Some(f.user.id),
            &ChangelogEntry::Deploy(DeployDetails {
                deployer: DeployerKind::Nomad,
                git_commit_hash: Some("abc".to_string()),
                app_url: Some("http://alice-blog.main.local".to_string()),
            }),
        )?;
        let deployments = f.db.list_deployments(f.site.id)?;
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].username.as_deref(), Some("alice"));
        assert_eq!(deployments[0].project.as_deref(), Some("blog"));
        assert_eq!(deployments[0].git_commit_hash.as_deref(), Some("abc"));
        Ok(())
    }

    #[test]
    fn test_changelog_survives_user_project_deletion() -> Result<()> {
        let f = fixture()?;
        let up = f.db.create_user_project(&f.user, &f.project, "repo-1", "git://x")?;
        f.db.add_changelog(
            f.site.id,
            Some(f.project.id),
            Some(f.user.id),
            &ChangelogEntry::UpdateUserProject(RunDetails::pending()),
        )?;
        f.db.delete_user_project(up.id)?;
        assert_eq!(count(&f.db, "changelog"), 1);
        Ok(())
    }

    #[test]
    fn test_project_detail_orders_tasks_and_checks() -> Result<()> {
        let f = fixture()?;
        f.db.update_tasks(f.project.id, &[new_task("t1", &["x", "y"]), new_task("t2", &[])])?;
        let detail = f.db.get_project_detail(f.project.id)?.unwrap();
        assert_eq!(detail.name, "blog");
        assert_eq!(detail.tasks.len(), 2);
        assert_eq!(detail.tasks[0].checks[1].name, "y");
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::new(CapstoneDb::new_in_memory()?);
        let site = handle
            .call(|db| db.create_site("main", "a.test"))
            .await?;
        let found = handle.call(|db| db.get_site("main")).await?;
        assert_eq!(found, Some(site));
        Ok(())
    }
}
