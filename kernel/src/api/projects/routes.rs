//! REST API routes for project and branch management.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers::{
    create_branch, delete_branch, delete_project, get_branch, get_project, init_project,
    list_branches, list_projects, reset_branch, resume_project, set_default, stop_project,
    use_branch,
};
use crate::host::HostState;

/// API routes mounted at `/api/v1/projects`.
pub fn routes() -> Router<Arc<HostState>> {
    Router::new()
        .route("/api/v1/projects", get(list_projects).post(init_project))
        .route(
            "/api/v1/projects/{project}",
            get(get_project).delete(delete_project),
        )
        .route("/api/v1/projects/{project}/stop", post(stop_project))
        .route("/api/v1/projects/{project}/resume", post(resume_project))
        .route("/api/v1/projects/{project}/default", post(set_default))
        .route(
            "/api/v1/projects/{project}/branches",
            get(list_branches).post(create_branch),
        )
        .route(
            "/api/v1/projects/{project}/branches/{branch}",
            get(get_branch).delete(delete_branch),
        )
        .route(
            "/api/v1/projects/{project}/branches/{branch}/use",
            post(use_branch),
        )
        .route(
            "/api/v1/projects/{project}/branches/{branch}/reset",
            post(reset_branch),
        )
}
