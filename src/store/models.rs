use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Tenancy ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub site_id: i64,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub created_at: String,
}

// ── Projects, tasks and checks ────────────────────────────────────────

/// Deployment backend a project's learner apps are shipped with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployerKind {
    #[default]
    Nomad,
    Custom,
}

impl DeployerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nomad => "nomad",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for DeployerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nomad" => Ok(Self::Nomad),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid deployer: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub site_id: i64,
    pub name: String,
    pub title: String,
    pub short_description: String,
    pub description: String,
    pub tags: Vec<String>,
    pub is_published: bool,
    /// Repo provider handle of the project's own content repo.
    pub repo_id: Option<String>,
    pub git_url: Option<String>,
    /// `None` means the configured default backend.
    pub deployer: Option<DeployerKind>,
    pub created_at: String,
}

/// Fields accepted when creating a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub deployer: Option<DeployerKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub title: String,
    pub description: String,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCheck {
    pub id: i64,
    pub task_id: i64,
    pub name: String,
    pub title: String,
    pub args: serde_json::Value,
    pub position: i64,
}

/// Task definition as declared in a project's metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checks: Vec<NewCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCheck {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Project with its ordered tasks and checks, as served to the checker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDetail {
    pub name: String,
    pub title: String,
    pub git_url: Option<String>,
    pub tasks: Vec<TaskDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDetail {
    pub name: String,
    pub title: String,
    pub description: String,
    pub checks: Vec<CheckDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckDetail {
    pub name: String,
    pub title: String,
    pub args: serde_json::Value,
}

// ── Learner progress ──────────────────────────────────────────────────

/// Free-form app settings kept on a user project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    /// Last known URL of the deployed app.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProject {
    pub id: i64,
    pub user_id: i64,
    pub project_id: i64,
    /// Repo provider handle. Doubles as the webhook secret.
    pub repo_id: String,
    pub git_url: String,
    pub app_settings: AppSettings,
    pub created_at: String,
}

/// Everything needed to act on one user project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProjectContext {
    pub site: Site,
    pub user: User,
    pub project: Project,
    pub user_project: UserProject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Failing,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Failing => "Failing",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "In Progress" => Ok(Self::InProgress),
            "Completed" => Ok(Self::Completed),
            "Failing" => Ok(Self::Failing),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    #[default]
    Pending,
    Pass,
    Fail,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid check status: {}", s)),
        }
    }
}

/// Per-task progress of one learner, with check results in position order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub task_id: i64,
    pub name: String,
    pub title: String,
    pub position: i64,
    /// Stored status; at most one task per user project is `In Progress`.
    pub status: TaskStatus,
    pub checks: Vec<CheckProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckProgress {
    pub check_id: i64,
    pub name: String,
    pub title: String,
    pub status: CheckStatus,
    pub message: Option<String>,
}

// ── Changelog ─────────────────────────────────────────────────────────

/// Lifecycle of one pipeline run recorded in the changelog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Queued,
    Deploy,
    Checks,
    Sync,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunDetails {
    pub status: RunStatus,
    pub stage: PipelineStage,
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_hash: Option<String>,
}

impl RunDetails {
    pub fn pending() -> Self {
        Self {
            status: RunStatus::Pending,
            stage: PipelineStage::Queued,
            log: String::new(),
            git_commit_hash: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployDetails {
    #[serde(rename = "type")]
    pub deployer: DeployerKind,
    pub git_commit_hash: Option<String>,
    pub app_url: Option<String>,
}

/// Typed changelog payload. Stored as an `action` column plus a JSON
/// `details` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "details", rename_all = "snake_case")]
pub enum ChangelogEntry {
    UpdateUserProject(RunDetails),
    UpdateProject(RunDetails),
    Deploy(DeployDetails),
}

impl ChangelogEntry {
    pub fn action(&self) -> &'static str {
        match self {
            Self::UpdateUserProject(_) => "update_user_project",
            Self::UpdateProject(_) => "update_project",
            Self::Deploy(_) => "deploy",
        }
    }

    pub fn run_details(&self) -> Option<&RunDetails> {
        match self {
            Self::UpdateUserProject(d) | Self::UpdateProject(d) => Some(d),
            Self::Deploy(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Changelog {
    pub id: i64,
    pub site_id: i64,
    pub project_id: Option<i64>,
    pub user_id: Option<i64>,
    #[serde(flatten)]
    pub entry: ChangelogEntry,
    pub timestamp: String,
}

/// One row of a run history view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    pub changelog_id: i64,
    pub timestamp: String,
    pub status: RunStatus,
    pub log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub deployer: DeployerKind,
    pub project: Option<String>,
    pub username: Option<String>,
    pub git_commit_hash: Option<String>,
    pub app_url: Option<String>,
}
