//! Read models returned by `status`, `show` and `list`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::domain::{Branch, BranchName, BranchState, Project, ProjectName};
use crate::supervisor::ProcessHealth;
use crate::volume::SubvolumeUsage;

/// One branch with live information.
#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    /// Branch name.
    pub name: BranchName,
    /// Parent branch.
    pub parent: Option<BranchName>,
    /// Recorded lifecycle state.
    pub state: BranchState,
    /// Live process health, if the branch has a process.
    pub health: Option<ProcessHealth>,
    /// Database port.
    pub port: u16,
    /// Snapshot location.
    pub snapshot_path: PathBuf,
    /// Logical size, if the volume is mounted.
    pub usage: Option<SubvolumeUsage>,
    /// Whether this is the project's active branch.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Age in whole seconds.
    pub age_secs: i64,
}

impl BranchReport {
    pub(super) fn new(
        branch: &Branch,
        active: bool,
        health: Option<ProcessHealth>,
        usage: Option<SubvolumeUsage>,
    ) -> Self {
        Self {
            name: branch.name.clone(),
            parent: branch.parent.clone(),
            state: branch.state,
            health,
            port: branch.port,
            snapshot_path: branch.snapshot_path.clone(),
            usage,
            active,
            created_at: branch.created_at,
            age_secs: (Utc::now() - branch.created_at).num_seconds(),
        }
    }
}

/// A project with all of its branches.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    /// Project name.
    pub project: ProjectName,
    /// Proxy port clients connect to.
    pub proxy_port: u16,
    /// Active branch.
    pub active_branch: BranchName,
    /// Whether the project volume is mounted.
    pub mounted: bool,
    /// Mount point of the volume.
    pub mount_point: PathBuf,
    /// Branches, oldest first.
    pub branches: Vec<BranchReport>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Summary row for `projects`.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    /// Project name.
    pub name: ProjectName,
    /// Proxy port.
    pub proxy_port: u16,
    /// Active branch.
    pub active_branch: BranchName,
    /// Whether this is the default project.
    pub default: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ProjectSummary {
    pub(super) fn new(project: &Project, default: bool) -> Self {
        Self {
            name: project.name.clone(),
            proxy_port: project.proxy_port,
            active_branch: project.active_branch.clone(),
            default,
            created_at: project.created_at,
        }
    }
}
