//! API Handler implementations for project and branch management.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

use super::types::{BranchResponse, CreateBranchRequest, InitProjectRequest};
use crate::branch_manager::{BranchError, BranchReport, ErrorKind, ProjectStatus, ProjectSummary};
use crate::domain::{BranchName, NameError, Project, ProjectName};
use crate::host::HostState;

/// API errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Domain-level branch error.
    #[error(transparent)]
    Branch(#[from] BranchError),
    /// Malformed project or branch name in the path or body.
    #[error(transparent)]
    InvalidName(#[from] NameError),
}

impl ApiError {
    /// Status code for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidName(_) => StatusCode::BAD_REQUEST,
            ApiError::Branch(e) => status_for(e.kind()),
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InvalidName(_) => ErrorKind::InvalidInput,
            ApiError::Branch(e) => e.kind(),
        }
    }
}

/// HTTP status for an error kind.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::State => StatusCode::CONFLICT,
        ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Dependency => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind().as_str(),
        }));
        (status, body).into_response()
    }
}

fn project_name(raw: &str) -> Result<ProjectName, ApiError> {
    Ok(ProjectName::new(raw)?)
}

fn branch_name(raw: &str) -> Result<BranchName, ApiError> {
    Ok(BranchName::new(raw)?)
}

/// GET /api/v1/projects
pub async fn list_projects(
    State(state): State<Arc<HostState>>,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    Ok(Json(state.manager().list_projects().await?))
}

/// POST /api/v1/projects
///
/// Initialise a project with its `main` branch.
pub async fn init_project(
    State(state): State<Arc<HostState>>,
    Json(req): Json<InitProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let name = project_name(&req.name)?;
    let project = state.manager().init(&name, req.proxy_port).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/v1/projects/{project}
pub async fn get_project(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
) -> Result<Json<ProjectStatus>, ApiError> {
    let project = project_name(&project)?;
    Ok(Json(state.manager().status(&project).await?))
}

/// DELETE /api/v1/projects/{project}
pub async fn delete_project(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
) -> Result<StatusCode, ApiError> {
    let project = project_name(&project)?;
    state.manager().delete_project(&project).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/projects/{project}/stop
pub async fn stop_project(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
) -> Result<StatusCode, ApiError> {
    let project = project_name(&project)?;
    state.manager().stop_project(&project).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/projects/{project}/resume
pub async fn resume_project(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
) -> Result<Json<Vec<BranchResponse>>, ApiError> {
    let project = project_name(&project)?;
    let branches = state.manager().resume_project(&project).await?;
    Ok(Json(branches.into_iter().map(BranchResponse::from).collect()))
}

/// POST /api/v1/projects/{project}/default
pub async fn set_default(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
) -> Result<StatusCode, ApiError> {
    let project = project_name(&project)?;
    state.manager().set_default(&project).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/projects/{project}/branches
pub async fn list_branches(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
) -> Result<Json<Vec<BranchResponse>>, ApiError> {
    let project = project_name(&project)?;
    let branches = state.manager().list_branches(&project).await?;
    Ok(Json(branches.into_iter().map(BranchResponse::from).collect()))
}

/// POST /api/v1/projects/{project}/branches
///
/// Snapshot a branch; the active branch is unchanged.
pub async fn create_branch(
    State(state): State<Arc<HostState>>,
    Path(project): Path<String>,
    Json(req): Json<CreateBranchRequest>,
) -> Result<(StatusCode, Json<BranchResponse>), ApiError> {
    let project = project_name(&project)?;
    let name = branch_name(&req.name)?;
    let source = req.source.as_deref().map(branch_name).transpose()?;
    let branch = state
        .manager()
        .create(&project, &name, source.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(branch.into())))
}

/// GET /api/v1/projects/{project}/branches/{branch}
pub async fn get_branch(
    State(state): State<Arc<HostState>>,
    Path((project, branch)): Path<(String, String)>,
) -> Result<Json<BranchReport>, ApiError> {
    let (project, branch) = (project_name(&project)?, branch_name(&branch)?);
    Ok(Json(state.manager().show(&project, &branch).await?))
}

/// DELETE /api/v1/projects/{project}/branches/{branch}
pub async fn delete_branch(
    State(state): State<Arc<HostState>>,
    Path((project, branch)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let (project, branch) = (project_name(&project)?, branch_name(&branch)?);
    state.manager().delete_branch(&project, &branch).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/projects/{project}/branches/{branch}/use
pub async fn use_branch(
    State(state): State<Arc<HostState>>,
    Path((project, branch)): Path<(String, String)>,
) -> Result<Json<BranchResponse>, ApiError> {
    let (project, branch) = (project_name(&project)?, branch_name(&branch)?);
    let branch = state.manager().use_branch(&project, &branch).await?;
    Ok(Json(branch.into()))
}

/// POST /api/v1/projects/{project}/branches/{branch}/reset
pub async fn reset_branch(
    State(state): State<Arc<HostState>>,
    Path((project, branch)): Path<(String, String)>,
) -> Result<Json<BranchResponse>, ApiError> {
    let (project, branch) = (project_name(&project)?, branch_name(&branch)?);
    let branch = state.manager().reset_branch(&project, &branch).await?;
    Ok(Json(branch.into()))
}
