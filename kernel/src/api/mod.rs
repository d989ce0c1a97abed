//! REST API for dBranch.
//!
//! HTTP endpoints for managing projects and branches, mounted under
//! `/api/v1/projects` on the control plane.

pub mod projects;

pub use projects::routes as project_routes;
pub use projects::ApiError;
