//! Request/Response Types for the Project API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::{Branch, BranchName, BranchState, ProjectName};

/// Request to initialise a project.
#[derive(Debug, Clone, Deserialize)]
pub struct InitProjectRequest {
    /// Project name.
    pub name: String,
    /// Proxy port; the configured default when absent.
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

/// Request to create a branch.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBranchRequest {
    /// New branch name.
    pub name: String,
    /// Branch to snapshot; the active branch when absent.
    #[serde(default)]
    pub source: Option<String>,
}

/// Branch as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct BranchResponse {
    pub project: ProjectName,
    pub name: BranchName,
    pub parent: Option<BranchName>,
    pub state: BranchState,
    pub port: u16,
    pub snapshot_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl From<Branch> for BranchResponse {
    fn from(branch: Branch) -> Self {
        Self {
            project: branch.project,
            name: branch.name,
            parent: branch.parent,
            state: branch.state,
            port: branch.port,
            snapshot_path: branch.snapshot_path,
            created_at: branch.created_at,
        }
    }
}
