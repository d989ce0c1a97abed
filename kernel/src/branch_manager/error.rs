use serde::Serialize;
use thiserror::Error;

use crate::domain::{BranchName, BranchState, InvalidTransition, NameError, ProjectName};
use crate::store::StoreError;
use crate::supervisor::SupervisorError;
use crate::volume::VolumeError;

/// Coarse classification of a [`BranchError`], used by the CLI exit code
/// and the HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A project or branch does not exist.
    NotFound,
    /// A name, port or volume is already taken.
    Conflict,
    /// No free port is left.
    ResourceExhausted,
    /// The filesystem or process runtime failed.
    Dependency,
    /// Something did not become ready in time.
    Timeout,
    /// The operation is not allowed in the current state.
    State,
    /// The request itself is malformed.
    InvalidInput,
    /// Store corruption or a bug.
    Internal,
}

impl ErrorKind {
    /// Stable snake-case label, used in metrics and API bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Dependency => "dependency",
            Self::Timeout => "timeout",
            Self::State => "state",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }
}

/// Errors returned by [`super::BranchManager`].
#[derive(Debug, Error)]
pub enum BranchError {
    /// Project does not exist.
    #[error("project '{0}' not found")]
    ProjectNotFound(ProjectName),

    /// Branch does not exist.
    #[error("branch '{branch}' not found in project '{project}'")]
    BranchNotFound {
        /// Project.
        project: ProjectName,
        /// Missing branch.
        branch: BranchName,
    },

    /// No project given and no default project set.
    #[error("no project given and no default project set")]
    NoDefaultProject,

    /// `init` on an existing project.
    #[error("project '{0}' is already initialized")]
    AlreadyInitialized(ProjectName),

    /// Branch name already taken within the project.
    #[error("branch '{branch}' already exists in project '{project}'")]
    DuplicateBranchName {
        /// Project.
        project: ProjectName,
        /// Duplicate name.
        branch: BranchName,
    },

    /// The port is already assigned elsewhere.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// Every port in the configured range is taken.
    #[error("no free port in range {min}-{max}")]
    PortExhausted {
        /// Range start.
        min: u16,
        /// Range end.
        max: u16,
    },

    /// The branch database failed to start; the branch is now `failed`.
    #[error("branch '{branch}' of '{project}' is not ready")]
    BranchNotReady {
        /// Project.
        project: ProjectName,
        /// Branch that failed.
        branch: BranchName,
        /// Why startup failed.
        #[source]
        source: SupervisorError,
    },

    /// The active branch cannot be deleted.
    #[error("branch '{branch}' is active in '{project}'; switch to another branch first")]
    ActiveBranch {
        /// Project.
        project: ProjectName,
        /// Active branch.
        branch: BranchName,
    },

    /// Children are still being snapshotted from the branch.
    #[error("branch '{branch}' of '{project}' has child branches being created: {}", children.join(", "))]
    HasDependents {
        /// Project.
        project: ProjectName,
        /// Parent branch.
        branch: BranchName,
        /// Child branch names.
        children: Vec<String>,
    },

    /// The branch is in a state that does not allow the operation.
    #[error("cannot {op} branch '{branch}' of '{project}' while it is {state}")]
    InvalidState {
        /// Project.
        project: ProjectName,
        /// Branch.
        branch: BranchName,
        /// Current state.
        state: BranchState,
        /// Attempted operation.
        op: &'static str,
    },

    /// The project is stopped (volume unmounted).
    #[error("project '{0}' is stopped; resume it first")]
    ProjectStopped(ProjectName),

    /// Lifecycle violation.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Invalid project or branch name.
    #[error(transparent)]
    InvalidName(#[from] NameError),

    /// Volume driver failure.
    #[error("volume operation failed: {0}")]
    Volume(#[from] VolumeError),

    /// Process supervisor failure.
    #[error("process supervisor failed: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Branch store failure.
    #[error("branch store failed: {0}")]
    Store(StoreError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BranchError {
    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProjectNotFound(_) | Self::BranchNotFound { .. } | Self::NoDefaultProject => {
                ErrorKind::NotFound
            }
            Self::AlreadyInitialized(_) | Self::DuplicateBranchName { .. } | Self::PortInUse(_) => {
                ErrorKind::Conflict
            }
            Self::PortExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::BranchNotReady { source, .. } | Self::Supervisor(source) => match source {
                SupervisorError::StartupTimeout { .. } => ErrorKind::Timeout,
                _ => ErrorKind::Dependency,
            },
            Self::ActiveBranch { .. }
            | Self::HasDependents { .. }
            | Self::InvalidState { .. }
            | Self::ProjectStopped(_)
            | Self::InvalidTransition(_) => ErrorKind::State,
            Self::InvalidName(_) => ErrorKind::InvalidInput,
            Self::Volume(e) => match e {
                VolumeError::SourceNotFound { .. } => ErrorKind::NotFound,
                VolumeError::SnapshotConflict { .. }
                | VolumeError::VolumeExists { .. }
                | VolumeError::MountPointBusy { .. } => ErrorKind::Conflict,
                VolumeError::NotMounted { .. } => ErrorKind::State,
                _ => ErrorKind::Dependency,
            },
            Self::Store(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for BranchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProjectNotFound(p) => Self::ProjectNotFound(p),
            StoreError::ProjectExists(p) => Self::AlreadyInitialized(p),
            StoreError::BranchNotFound { project, branch } => {
                Self::BranchNotFound { project, branch }
            }
            StoreError::BranchExists { project, branch } => {
                Self::DuplicateBranchName { project, branch }
            }
            StoreError::PortInUse(port) => Self::PortInUse(port),
            StoreError::ActiveBranch { project, branch } => Self::ActiveBranch { project, branch },
            StoreError::HasChildren {
                project,
                branch,
                children,
            } => Self::HasDependents {
                project,
                branch,
                children,
            },
            StoreError::Transition(t) => Self::InvalidTransition(t),
            other => Self::Store(other),
        }
    }
}

impl From<tokio::task::JoinError> for BranchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {err}"))
    }
}
