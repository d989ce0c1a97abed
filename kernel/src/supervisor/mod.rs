//! Lifecycle of the database process behind each branch.

mod core;
mod docker;
#[cfg(unix)]
mod local;
pub mod probe;
mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use self::core::{ProcessHealth, ProcessSupervisor, SupervisorError};
pub use docker::DockerRuntime;
#[cfg(unix)]
pub use local::LocalProcessRuntime;
pub use runtime::{LaunchSpec, ProcessHandle, ProcessRuntime, RuntimeError};

use std::sync::Arc;

use crate::infrastructure::config::{RuntimeKind, SupervisorSettings};

/// Builds the runtime selected by `settings.runtime`.
///
/// # Errors
///
/// Fails if the runtime is not available on this platform.
pub fn runtime_from_settings(
    settings: &SupervisorSettings,
) -> Result<Arc<dyn ProcessRuntime>, RuntimeError> {
    match settings.runtime {
        RuntimeKind::Docker => Ok(Arc::new(DockerRuntime::new(settings.clone()))),
        #[cfg(unix)]
        RuntimeKind::Process => Ok(Arc::new(LocalProcessRuntime::new(settings.clone()))),
        #[cfg(not(unix))]
        RuntimeKind::Process => Err(RuntimeError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "the process runtime requires a unix host",
        ))),
    }
}
