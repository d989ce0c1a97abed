//! Capability boundary between the supervisor and whatever hosts processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use super::probe;
use crate::domain::Branch;

/// Everything a runtime needs to launch one branch database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Stable process/container name, `<project>_<branch>`.
    pub name: String,
    /// Data directory inside the branch snapshot.
    pub data_dir: PathBuf,
    /// Host port the database must listen on.
    pub port: u16,
}

impl LaunchSpec {
    /// Launch parameters for `branch`.
    #[must_use]
    pub fn for_branch(branch: &Branch) -> Self {
        Self {
            name: branch.process_name(),
            data_dir: branch.data_dir(),
            port: branch.port,
        }
    }
}

/// Reference to a launched process, persisted as the branch's `process_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Runtime-specific identifier (container name, pid, ...).
    pub id: String,
    /// Port the process serves.
    pub port: u16,
}

impl ProcessHandle {
    /// Rebuilds the handle recorded for `branch`, if it has one.
    #[must_use]
    pub fn of(branch: &Branch) -> Option<Self> {
        branch.process_ref.as_ref().map(|id| Self {
            id: id.clone(),
            port: branch.port,
        })
    }
}

/// Errors raised by a [`ProcessRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime's program could not be executed at all.
    #[error("runtime program '{program}' is unavailable")]
    Unavailable {
        /// Program that failed to spawn.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A runtime command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        /// Command line that failed.
        command: String,
        /// Exit status.
        status: std::process::ExitStatus,
        /// Trimmed standard error.
        stderr: String,
    },

    /// A docker command could not be executed or was rejected.
    #[error("docker {command} failed: {message}")]
    Docker {
        /// Docker subcommand, e.g. `run`.
        command: &'static str,
        /// Error reported by the docker client.
        message: String,
    },

    /// The handle does not refer to anything this runtime launched.
    #[error("unknown process handle '{0}'")]
    UnknownHandle(String),

    /// Signal delivery or other OS-level failure.
    #[error("process control failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Launches, signals and probes branch database processes.
#[async_trait]
pub trait ProcessRuntime: Send + Sync + std::fmt::Debug {
    /// Short runtime name for logs.
    fn name(&self) -> &'static str;

    /// Launches a process for `spec` without waiting for readiness.
    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessHandle, RuntimeError>;

    /// Asks the process to shut down gracefully; does not wait.
    async fn terminate(&self, handle: &ProcessHandle) -> Result<(), RuntimeError>;

    /// Forcefully terminates the process and releases its resources.
    /// Cleans up without error if it has already exited.
    async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError>;

    /// Whether the process is still running.
    async fn is_alive(&self, handle: &ProcessHandle) -> Result<bool, RuntimeError>;

    /// Whether the process is ready to serve clients.
    ///
    /// Defaults to the port accepting a TCP connection.
    async fn ready(&self, handle: &ProcessHandle) -> bool {
        probe::accepts_connections(handle.port).await
    }
}

/// Replaces `{key}` placeholders in `template`.
pub(crate) fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}
