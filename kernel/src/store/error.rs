use crate::domain::{BranchName, InvalidTransition, ProjectName};

/// Errors that can occur when using the branch store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database-related error.
    #[error("Database Error: {0}")]
    DbError(#[from] sqlx::Error),

    /// A project with this name is already registered.
    #[error("project '{0}' already exists")]
    ProjectExists(ProjectName),

    /// No project with this name.
    #[error("project '{0}' not found")]
    ProjectNotFound(ProjectName),

    /// The branch name is taken within the project.
    #[error("branch '{branch}' already exists in project '{project}'")]
    BranchExists {
        /// Project.
        project: ProjectName,
        /// Duplicate name.
        branch: BranchName,
    },

    /// No branch with this name in the project.
    #[error("branch '{branch}' not found in project '{project}'")]
    BranchNotFound {
        /// Project.
        project: ProjectName,
        /// Missing branch.
        branch: BranchName,
    },

    /// The port is already assigned to another branch or proxy.
    #[error("port {0} is already allocated")]
    PortInUse(u16),

    /// The active branch cannot be removed.
    #[error("branch '{branch}' is the active branch of '{project}'")]
    ActiveBranch {
        /// Project.
        project: ProjectName,
        /// Active branch.
        branch: BranchName,
    },

    /// Child branches are still being snapshotted from this branch.
    #[error("branch '{branch}' of '{project}' has child branches being created: {children:?}")]
    HasChildren {
        /// Project.
        project: ProjectName,
        /// Parent branch.
        branch: BranchName,
        /// Names of the pending children.
        children: Vec<String>,
    },

    /// A status change that the lifecycle forbids.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// A stored row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
