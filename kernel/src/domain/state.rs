//! Branch lifecycle state machine.
//!
//! ```text
//! uninitialized -> creating -> stopped -> starting -> running -> stopping -> stopped
//! stopped | failed -> deleting -> deleted
//! creating | starting -> failed -> (reset) -> stopped
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a branch and its database process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    /// Not yet materialised on disk.
    #[default]
    Uninitialized,
    /// Snapshot is being created.
    Creating,
    /// Snapshot exists, no process.
    Stopped,
    /// Process launched, waiting for readiness.
    Starting,
    /// Process accepting connections.
    Running,
    /// Process shutting down.
    Stopping,
    /// Subvolume and record being removed.
    Deleting,
    /// Gone. Never persisted; records are removed instead.
    Deleted,
    /// Creation or startup failed; needs an explicit reset.
    Failed,
}

/// A rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid branch state transition from {from} to {to}")]
pub struct InvalidTransition {
    /// State the branch was in.
    pub from: BranchState,
    /// State that was requested.
    pub to: BranchState,
}

impl BranchState {
    /// Every state, in lifecycle order.
    pub const ALL: [BranchState; 9] = [
        BranchState::Uninitialized,
        BranchState::Creating,
        BranchState::Stopped,
        BranchState::Starting,
        BranchState::Running,
        BranchState::Stopping,
        BranchState::Deleting,
        BranchState::Deleted,
        BranchState::Failed,
    ];

    /// Stable lowercase representation used in storage and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BranchState::Uninitialized => "uninitialized",
            BranchState::Creating => "creating",
            BranchState::Stopped => "stopped",
            BranchState::Starting => "starting",
            BranchState::Running => "running",
            BranchState::Stopping => "stopping",
            BranchState::Deleting => "deleting",
            BranchState::Deleted => "deleted",
            BranchState::Failed => "failed",
        }
    }

    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, to: BranchState) -> bool {
        use BranchState::{
            Creating, Deleted, Deleting, Failed, Running, Starting, Stopped, Stopping,
            Uninitialized,
        };
        matches!(
            (self, to),
            (Uninitialized, Creating)
                | (Creating, Stopped | Failed)
                | (Stopped, Starting | Deleting)
                | (Starting, Running | Failed)
                // Running -> Stopped records a process that exited on its own.
                | (Running, Stopping | Stopped)
                | (Stopping, Stopped)
                // Deleting -> Stopped rolls back a deletion whose subvolume removal failed.
                | (Deleting, Deleted | Stopped)
                | (Failed, Stopped | Deleting)
        )
    }

    /// Validates `self -> to`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the state machine forbids the change.
    pub const fn transition_to(self, to: BranchState) -> Result<BranchState, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// States from which the machine never moves on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, BranchState::Deleted | BranchState::Failed)
    }

    /// Whether a process may be alive for a branch in this state.
    #[must_use]
    pub const fn has_process(self) -> bool {
        matches!(
            self,
            BranchState::Starting | BranchState::Running | BranchState::Stopping
        )
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown state string read from storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown branch state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for BranchState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BranchState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
