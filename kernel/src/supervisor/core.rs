use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::runtime::{LaunchSpec, ProcessHandle, ProcessRuntime, RuntimeError};
use crate::domain::Branch;
use crate::infrastructure::config::SupervisorSettings;

/// Errors from starting or stopping branch databases.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The runtime failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The database never accepted connections; the process was terminated.
    #[error("'{name}' did not accept connections on port {port} within {timeout:?}")]
    StartupTimeout {
        /// Process name.
        name: String,
        /// Port probed.
        port: u16,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The process exited before it became ready.
    #[error("'{name}' exited during startup")]
    ExitedDuringStartup {
        /// Process name.
        name: String,
    },
}

/// Observed liveness of a branch process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessHealth {
    /// Process is up.
    Running,
    /// Process is gone.
    Stopped,
    /// The runtime could not report on the process.
    Failed,
}

/// Starts, stops and probes branch databases through a [`ProcessRuntime`].
///
/// Never restarts anything on its own.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    runtime: Arc<dyn ProcessRuntime>,
    startup_timeout: Duration,
    stop_grace: Duration,
    poll: Duration,
}

impl ProcessSupervisor {
    /// Creates a supervisor with timings from `settings`.
    #[must_use]
    pub fn new(runtime: Arc<dyn ProcessRuntime>, settings: &SupervisorSettings) -> Self {
        Self {
            runtime,
            startup_timeout: settings.startup_timeout(),
            stop_grace: settings.stop_grace(),
            poll: settings.ready_poll(),
        }
    }

    /// Overrides the timings; used by tests that cannot wait seconds.
    #[must_use]
    pub fn with_timings(mut self, startup_timeout: Duration, stop_grace: Duration, poll: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self.stop_grace = stop_grace;
        self.poll = poll;
        self
    }

    /// The runtime in use.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ProcessRuntime> {
        &self.runtime
    }

    /// Launches the branch database and waits until the runtime reports it ready.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::StartupTimeout`] or
    /// [`SupervisorError::ExitedDuringStartup`] after terminating the process,
    /// or a runtime error if the launch itself failed.
    #[instrument(skip(self, branch), fields(project = %branch.project, branch = %branch.name, port = branch.port))]
    pub async fn start(&self, branch: &Branch) -> Result<ProcessHandle, SupervisorError> {
        let spec = LaunchSpec::for_branch(branch);
        let handle = self.runtime.run(&spec).await?;

        match tokio::time::timeout(self.startup_timeout, self.wait_ready(&spec, &handle)).await {
            Ok(Ok(())) => {
                info!("{} ready on port {}", spec.name, spec.port);
                Ok(handle)
            }
            Ok(Err(e)) => {
                self.force(&handle).await;
                Err(e)
            }
            Err(_) => {
                warn!("{} not ready after {:?}", spec.name, self.startup_timeout);
                self.force(&handle).await;
                Err(SupervisorError::StartupTimeout {
                    name: spec.name,
                    port: spec.port,
                    timeout: self.startup_timeout,
                })
            }
        }
    }

    async fn wait_ready(&self, spec: &LaunchSpec, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        loop {
            if self.runtime.ready(handle).await {
                return Ok(());
            }
            if !self.runtime.is_alive(handle).await? {
                return Err(SupervisorError::ExitedDuringStartup {
                    name: spec.name.clone(),
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Stops a process: graceful signal, up to `stop_grace` to exit, then force.
    ///
    /// # Errors
    ///
    /// Returns an error only if the forced termination fails.
    #[instrument(skip(self))]
    pub async fn stop(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        if let Err(e) = self.runtime.terminate(handle).await {
            warn!("Graceful stop of {} failed: {}", handle.id, e);
        }

        let exited = tokio::time::timeout(self.stop_grace, async {
            loop {
                match self.runtime.is_alive(handle).await {
                    Ok(false) => return,
                    Ok(true) => {}
                    Err(e) => warn!("Liveness probe of {} failed: {}", handle.id, e),
                }
                tokio::time::sleep(self.poll).await;
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!("{} ignored graceful stop for {:?}; killing", handle.id, self.stop_grace);
        }
        self.runtime.kill(handle).await?;
        Ok(())
    }

    /// Reports whether the process behind `handle` is running.
    pub async fn health_check(&self, handle: &ProcessHandle) -> ProcessHealth {
        match self.runtime.is_alive(handle).await {
            Ok(true) => ProcessHealth::Running,
            Ok(false) => ProcessHealth::Stopped,
            Err(e) => {
                warn!("Health check of {} failed: {}", handle.id, e);
                ProcessHealth::Failed
            }
        }
    }

    async fn force(&self, handle: &ProcessHandle) {
        if let Err(e) = self.runtime.kill(handle).await {
            warn!("Failed to terminate {}: {}", handle.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BranchName, BranchState, ProjectName};
    use crate::supervisor::testing::LoopbackRuntime;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn branch(port: u16) -> Branch {
        Branch {
            project: ProjectName::new("p1").unwrap(),
            name: BranchName::main(),
            parent: None,
            snapshot_path: PathBuf::from("/unused"),
            port,
            state: BranchState::Stopped,
            process_ref: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn supervisor(runtime: Arc<LoopbackRuntime>) -> ProcessSupervisor {
        ProcessSupervisor::new(runtime, &SupervisorSettings::default()).with_timings(
            Duration::from_millis(300),
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn start_waits_for_port_then_stop_releases_it() {
        let runtime = Arc::new(LoopbackRuntime::new());
        let sup = supervisor(runtime.clone());
        let port = free_port();

        let handle = sup.start(&branch(port)).await.unwrap();
        assert_eq!(sup.health_check(&handle).await, ProcessHealth::Running);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        sup.stop(&handle).await.unwrap();
        assert_eq!(sup.health_check(&handle).await, ProcessHealth::Stopped);
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn unresponsive_start_times_out_and_is_cleaned_up() {
        let runtime = Arc::new(LoopbackRuntime::new());
        runtime.make_unresponsive("p1_main");
        let sup = supervisor(runtime.clone());

        let err = sup.start(&branch(free_port())).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn crashed_process_reports_stopped() {
        let runtime = Arc::new(LoopbackRuntime::new());
        let sup = supervisor(runtime.clone());
        let handle = sup.start(&branch(free_port())).await.unwrap();

        runtime.crash(&handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sup.health_check(&handle).await, ProcessHealth::Stopped);
    }

    /// Listens like the loopback runtime but never passes the readiness check.
    #[derive(Debug, Default)]
    struct ListeningNotReady(LoopbackRuntime);

    #[async_trait]
    impl ProcessRuntime for ListeningNotReady {
        fn name(&self) -> &'static str {
            "listening-not-ready"
        }

        async fn run(&self, spec: &LaunchSpec) -> Result<ProcessHandle, RuntimeError> {
            self.0.run(spec).await
        }

        async fn terminate(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
            self.0.terminate(handle).await
        }

        async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
            self.0.kill(handle).await
        }

        async fn is_alive(&self, handle: &ProcessHandle) -> Result<bool, RuntimeError> {
            self.0.is_alive(handle).await
        }

        async fn ready(&self, _handle: &ProcessHandle) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn open_port_alone_is_not_ready() {
        let runtime = Arc::new(ListeningNotReady::default());
        let sup = ProcessSupervisor::new(runtime.clone(), &SupervisorSettings::default())
            .with_timings(
                Duration::from_millis(200),
                Duration::from_millis(100),
                Duration::from_millis(10),
            );

        let err = sup.start(&branch(free_port())).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
        assert_eq!(runtime.0.running(), 0);
    }
}
