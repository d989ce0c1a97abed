//! Branch databases as local child processes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use super::probe;
use super::runtime::{substitute, LaunchSpec, ProcessHandle, ProcessRuntime, RuntimeError};
use crate::infrastructure::config::{ReadinessProbe, SupervisorSettings};

/// Spawns the configured program per branch and signals it by pid.
///
/// Processes started by another `dbranch` invocation are still controllable
/// through their recorded pid; only exit statuses are lost.
#[derive(Debug)]
pub struct LocalProcessRuntime {
    settings: SupervisorSettings,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalProcessRuntime {
    /// Creates a runtime from supervisor settings.
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn pid(handle: &ProcessHandle) -> Result<libc::pid_t, RuntimeError> {
        handle
            .id
            .parse::<libc::pid_t>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| RuntimeError::UnknownHandle(handle.id.clone()))
    }

    /// `kill(2)`; `Ok(false)` when the process no longer exists.
    fn signal(handle: &ProcessHandle, sig: libc::c_int) -> Result<bool, RuntimeError> {
        let pid = Self::pid(handle)?;
        // SAFETY: kill(2) takes no pointers; pid is positive so no group is signalled.
        if unsafe { libc::kill(pid, sig) } == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(RuntimeError::Io(err))
        }
    }

    fn needs_init(data_dir: &Path) -> bool {
        std::fs::read_dir(data_dir).map_or(true, |mut entries| entries.next().is_none())
    }

    async fn init_data_dir(&self, spec: &LaunchSpec) -> Result<(), RuntimeError> {
        let Some(program) = &self.settings.init_program else {
            return Ok(());
        };
        if !Self::needs_init(&spec.data_dir) {
            return Ok(());
        }

        let data_dir = spec.data_dir.display().to_string();
        let vars = [
            ("data_dir", data_dir.as_str()),
            ("user", self.settings.postgres_user.as_str()),
        ];
        let args: Vec<String> = self
            .settings
            .init_args
            .iter()
            .map(|a| substitute(a, &vars))
            .collect();

        info!("Initialising data directory {}", data_dir);
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Unavailable {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessRuntime for LocalProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(skip(self, spec), fields(process = %spec.name, port = spec.port))]
    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessHandle, RuntimeError> {
        self.init_data_dir(spec).await?;

        let data_dir = spec.data_dir.display().to_string();
        let port = spec.port.to_string();
        let vars = [("data_dir", data_dir.as_str()), ("port", port.as_str())];

        let mut cmd = Command::new(&self.settings.program);
        for arg in &self.settings.args {
            cmd.arg(substitute(arg, &vars));
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd.spawn().map_err(|source| RuntimeError::Unavailable {
            program: self.settings.program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::UnknownHandle(spec.name.clone()))?;
        let id = pid.to_string();
        self.children.lock().insert(id.clone(), child);

        info!("Spawned {} as pid {}", spec.name, pid);
        Ok(ProcessHandle {
            id,
            port: spec.port,
        })
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        Self::signal(handle, libc::SIGTERM).map(|_| ())
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        let tracked = self.children.lock().remove(&handle.id);
        match tracked {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    debug!("start_kill on {}: {}", handle.id, e);
                }
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap {}: {}", handle.id, e);
                }
                Ok(())
            }
            None => Self::signal(handle, libc::SIGKILL).map(|_| ()),
        }
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> Result<bool, RuntimeError> {
        {
            let mut children = self.children.lock();
            if let Some(child) = children.get_mut(&handle.id) {
                return match child.try_wait()? {
                    None => Ok(true),
                    Some(status) => {
                        debug!("{} exited with {}", handle.id, status);
                        children.remove(&handle.id);
                        Ok(false)
                    }
                };
            }
        }
        Self::signal(handle, 0)
    }

    async fn ready(&self, handle: &ProcessHandle) -> bool {
        match self.settings.readiness {
            ReadinessProbe::Postgres => probe::postgres_ready(handle.port).await,
            ReadinessProbe::Tcp => probe::accepts_connections(handle.port).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sleeper() -> LocalProcessRuntime {
        LocalProcessRuntime::new(SupervisorSettings {
            program: "sleep".into(),
            args: vec!["30".into()],
            init_program: None,
            ..SupervisorSettings::default()
        })
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "p1_main".into(),
            data_dir: PathBuf::from("/nonexistent"),
            port: 7000,
        }
    }

    #[tokio::test]
    async fn graceful_terminate_then_reap() {
        let runtime = sleeper();
        let handle = runtime.run(&spec()).await.unwrap();
        assert!(runtime.is_alive(&handle).await.unwrap());

        runtime.terminate(&handle).await.unwrap();
        let mut alive = true;
        for _ in 0..50 {
            alive = runtime.is_alive(&handle).await.unwrap();
            if !alive {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!alive);
        runtime.kill(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn kill_is_forceful_and_idempotent() {
        let runtime = sleeper();
        let handle = runtime.run(&spec()).await.unwrap();
        runtime.kill(&handle).await.unwrap();
        assert!(!runtime.is_alive(&handle).await.unwrap());
        runtime.kill(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let runtime = LocalProcessRuntime::new(SupervisorSettings {
            program: "/definitely/not/here".into(),
            init_program: None,
            ..SupervisorSettings::default()
        });
        let err = runtime.run(&spec()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable { .. }));
    }
}
