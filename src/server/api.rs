use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;

use crate::errors::CapstoneError;
use crate::lifecycle::Orchestrator;
use crate::store::models::{
    Changelog, HistoryItem, Project, ProjectDetail, Site, TaskProgress, User, UserProject,
    UserProjectContext,
};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
pub struct Queued {
    pub changelog_id: i64,
    pub status: &'static str,
}

/// Learner progress as served to the checker and to clients.
#[derive(Serialize)]
pub struct UserProjectView {
    pub username: String,
    pub project: String,
    pub git_url: String,
    pub app_url: Option<String>,
    pub tasks: Vec<TaskProgress>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<CapstoneError>() {
            Some(e) if e.is_not_found() => ApiError::NotFound(e.to_string()),
            Some(e) if e.is_conflict() => ApiError::Conflict(e.to_string()),
            Some(CapstoneError::SiteMismatch) => {
                ApiError::BadRequest(CapstoneError::SiteMismatch.to_string())
            }
            _ => ApiError::Internal(format!("{:#}", err)),
        }
    }
}

impl From<CapstoneError> for ApiError {
    fn from(err: CapstoneError) -> Self {
        anyhow::Error::from(err).into()
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// Bearer token check against `server.api_token`. An empty configured
/// token rejects everything.
pub struct Authorized;

impl FromRequestParts<SharedState> for Authorized {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let expected = &state.orchestrator.config.server.api_token;
        if expected.is_empty() {
            return Err(ApiError::Unauthorized("API token not configured".into()));
        }
        let provided = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();
        if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            Ok(Authorized)
        } else {
            Err(ApiError::Unauthorized("Invalid or missing bearer token".into()))
        }
    }
}

/// Tenant of the request: the site whose domain matches the `Host` header,
/// else `server.default_site`.
pub struct CurrentSite(pub Site);

impl FromRequestParts<SharedState> for CurrentSite {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase());
        let fallback = state.orchestrator.config.server.default_site.clone();
        let site = state
            .orchestrator
            .db
            .call(move |db| {
                if let Some(host) = host
                    && let Some(site) = db.find_site_by_domain(&host)?
                {
                    return Ok(Some(site));
                }
                db.get_site(&fallback)
            })
            .await?;
        site.map(CurrentSite).ok_or_else(|| {
            CapstoneError::SiteNotFound {
                name: state.orchestrator.config.server.default_site.clone(),
            }
            .into()
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/users/{username}/projects/{project}/hook/{repo_handle}",
            post(user_project_hook),
        )
        .route("/api/projects/{project}/hook/{repo_handle}", post(project_hook))
        .route("/api/projects/{project}", get(get_project))
        .route("/api/projects/{project}/history", get(project_history))
        .route(
            "/api/users/{username}/projects/{project}",
            get(get_user_project)
                .post(start_user_project)
                .delete(delete_user_project),
        )
        .route(
            "/api/users/{username}/projects/{project}/history",
            get(user_project_history),
        )
        .route("/api/changelog/{id}", get(get_changelog))
}

// ── Lookups ───────────────────────────────────────────────────────────

async fn lookup_project(
    state: &SharedState,
    site: &Site,
    name: String,
) -> Result<Option<Project>, ApiError> {
    let site_id = site.id;
    Ok(state
        .orchestrator
        .db
        .call(move |db| db.get_project(site_id, &name))
        .await?)
}

async fn find_project(state: &SharedState, site: &Site, name: String) -> Result<Project, ApiError> {
    lookup_project(state, site, name.clone())
        .await?
        .ok_or_else(|| CapstoneError::ProjectNotFound { name }.into())
}

async fn find_user(state: &SharedState, site: &Site, username: String) -> Result<User, ApiError> {
    let site_id = site.id;
    let lookup = username.clone();
    state
        .orchestrator
        .db
        .call(move |db| db.get_user(site_id, &lookup))
        .await?
        .ok_or_else(|| CapstoneError::UserNotFound { username }.into())
}

async fn find_context(
    state: &SharedState,
    site: &Site,
    username: String,
    project: String,
) -> Result<Option<UserProjectContext>, ApiError> {
    let site_id = site.id;
    Ok(state
        .orchestrator
        .db
        .call(move |db| db.get_user_project_context(site_id, &username, &project))
        .await?)
}

async fn require_context(
    state: &SharedState,
    site: &Site,
    username: String,
    project: String,
) -> Result<UserProjectContext, ApiError> {
    find_context(state, site, username.clone(), project.clone())
        .await?
        .ok_or_else(|| CapstoneError::UserProjectNotFound { username, project }.into())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Post-push webhook of a learner repo. The repo handle in the path is the
/// secret; any mismatch looks like an unknown user project.
async fn user_project_hook(
    State(state): State<SharedState>,
    CurrentSite(site): CurrentSite,
    Path((username, project, handle)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = find_context(&state, &site, username, project)
        .await?
        .filter(|ctx| constant_time_eq(ctx.user_project.repo_id.as_bytes(), handle.as_bytes()))
        .ok_or_else(|| ApiError::NotFound("Not found".into()))?;
    let changelog = state.orchestrator.enqueue_user_project_update(&ctx).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Queued {
            changelog_id: changelog.id,
            status: "pending",
        }),
    ))
}

/// Post-push webhook of a project content repo.
async fn project_hook(
    State(state): State<SharedState>,
    CurrentSite(site): CurrentSite,
    Path((project, handle)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = lookup_project(&state, &site, project)
        .await?
        .filter(|p| {
            p.repo_id
                .as_deref()
                .is_some_and(|id| constant_time_eq(id.as_bytes(), handle.as_bytes()))
        })
        .ok_or_else(|| ApiError::NotFound("Not found".into()))?;
    let changelog = state.orchestrator.enqueue_project_update(&project).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Queued {
            changelog_id: changelog.id,
            status: "pending",
        }),
    ))
}

async fn get_project(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path(name): Path<String>,
) -> Result<Json<ProjectDetail>, ApiError> {
    let project = find_project(&state, &site, name.clone()).await?;
    let project_id = project.id;
    let detail = state
        .orchestrator
        .db
        .call(move |db| db.get_project_detail(project_id))
        .await?
        .ok_or_else(|| ApiError::from(CapstoneError::ProjectNotFound { name }))?;
    Ok(Json(detail))
}

async fn project_history(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path(name): Path<String>,
) -> Result<Json<Vec<HistoryItem>>, ApiError> {
    let project = find_project(&state, &site, name).await?;
    let project_id = project.id;
    let history = state
        .orchestrator
        .db
        .call(move |db| db.project_history(project_id))
        .await?;
    Ok(Json(history))
}

async fn get_user_project(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path((username, project)): Path<(String, String)>,
) -> Result<Json<UserProjectView>, ApiError> {
    let ctx = require_context(&state, &site, username, project).await?;
    let id = ctx.user_project.id;
    let tasks = state
        .orchestrator
        .db
        .call(move |db| db.get_task_progress(id))
        .await?;
    Ok(Json(UserProjectView {
        username: ctx.user.username,
        project: ctx.project.name,
        git_url: ctx.user_project.git_url,
        app_url: ctx.user_project.app_settings.app_url,
        tasks,
    }))
}

async fn start_user_project(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path((username, project)): Path<(String, String)>,
) -> Result<(StatusCode, Json<UserProject>), ApiError> {
    let user = find_user(&state, &site, username).await?;
    let project = find_project(&state, &site, project).await?;
    let user_project = state
        .orchestrator
        .start_user_project(&user, &project)
        .await?;
    Ok((StatusCode::CREATED, Json(user_project)))
}

async fn delete_user_project(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path((username, project)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let ctx = require_context(&state, &site, username, project).await?;
    state.orchestrator.delete_user_project(&ctx).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_project_history(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path((username, project)): Path<(String, String)>,
) -> Result<Json<Vec<HistoryItem>>, ApiError> {
    let ctx = require_context(&state, &site, username, project).await?;
    let (user_id, project_id) = (ctx.user.id, ctx.project.id);
    let history = state
        .orchestrator
        .db
        .call(move |db| db.user_project_history(user_id, project_id))
        .await?;
    Ok(Json(history))
}

async fn get_changelog(
    State(state): State<SharedState>,
    _auth: Authorized,
    CurrentSite(site): CurrentSite,
    Path(id): Path<i64>,
) -> Result<Json<Changelog>, ApiError> {
    let changelog = state
        .orchestrator
        .db
        .call(move |db| db.get_changelog(id))
        .await?
        .filter(|c| c.site_id == site.id)
        .ok_or_else(|| ApiError::from(CapstoneError::ChangelogNotFound { id }))?;
    Ok(Json(changelog))
}
