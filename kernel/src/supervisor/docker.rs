//! Container runtime driven through `docker_wrapper`.

use async_trait::async_trait;
use docker_wrapper::{
    DockerCommand, InspectCommand, NetworkCreateCommand, NetworkLsCommand, RmCommand, RunCommand,
    StopCommand,
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::probe;
use super::runtime::{LaunchSpec, ProcessHandle, ProcessRuntime, RuntimeError};
use crate::infrastructure::config::{ReadinessProbe, SupervisorSettings};

const DATA_MOUNT: &str = "/var/lib/postgresql/data";

/// One container per branch, named `<project>_<branch>`.
#[derive(Debug)]
pub struct DockerRuntime {
    settings: SupervisorSettings,
}

impl DockerRuntime {
    /// Creates a runtime talking to the local docker daemon.
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        Self { settings }
    }

    /// Environment handed to the postgres image.
    pub(crate) fn container_env(&self) -> Vec<(&'static str, String)> {
        let s = &self.settings;
        vec![
            ("POSTGRES_USER", s.postgres_user.clone()),
            ("POSTGRES_PASSWORD", s.postgres_password.expose_secret().to_string()),
            ("POSTGRES_DB", s.postgres_db.clone()),
            ("PGDATA", format!("{DATA_MOUNT}/pgdata")),
        ]
    }

    fn launch_command(&self, spec: &LaunchSpec) -> RunCommand {
        let s = &self.settings;
        let mut run = RunCommand::new(s.image.as_str())
            .name(spec.name.as_str())
            .port(spec.port, s.container_port)
            .volume(spec.data_dir.display().to_string(), DATA_MOUNT)
            .restart("no")
            .detach();
        for (key, value) in self.container_env() {
            run = run.env(key, value);
        }
        if let Some(user) = &s.run_as {
            run = run.user(user.as_str());
        }
        if let Some(network) = &s.network {
            run = run.network(network.as_str());
        }
        run
    }

    async fn ensure_network(&self, network: &str) -> Result<(), RuntimeError> {
        let listed = NetworkLsCommand::new()
            .filter("name", network)
            .execute()
            .await
            .map_err(|e| docker_error("network ls", &e))?;
        if listed.success && network_listed(&listed.stdout, network) {
            debug!("Docker network '{}' already exists", network);
            return Ok(());
        }

        info!("Creating docker network '{}'", network);
        NetworkCreateCommand::new(network)
            .execute()
            .await
            .map_err(|e| docker_error("network create", &e))?;
        Ok(())
    }

    /// `Some(running)` for an existing container, `None` when there is none.
    async fn inspect(&self, name: &str) -> Option<bool> {
        match InspectCommand::new(name).execute().await {
            Ok(output) if output.success => parse_running(&output.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!("Inspect of '{}' failed: {}", name, e);
                None
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        match StopCommand::new(name).execute().await {
            Ok(output) if !output.is_success() => {
                debug!("Container {} might already be stopped: {}", name, output.stderr);
            }
            Ok(_) => {}
            Err(e) => debug!("Stop of {} failed: {}", name, e),
        }

        match RmCommand::new(name).volumes().execute().await {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.inspect(name).await.is_none() {
                    debug!("Container {} already gone: {}", name, e);
                    Ok(())
                } else {
                    Err(docker_error("rm", &e))
                }
            }
        }
    }
}

fn docker_error(command: &'static str, err: &impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Docker {
        command,
        message: err.to_string(),
    }
}

fn network_listed(stdout: &str, network: &str) -> bool {
    stdout
        .lines()
        .any(|line| line.split_whitespace().any(|field| field == network))
}

#[derive(Debug, Deserialize)]
struct InspectedContainer {
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running")]
    running: bool,
}

/// Reads `State.Running` from `docker inspect` JSON; `None` if no container is described.
fn parse_running(stdout: &str) -> Option<bool> {
    match serde_json::from_str::<Vec<InspectedContainer>>(stdout) {
        Ok(containers) => containers.first().map(|c| c.state.running),
        Err(e) => {
            warn!("Unreadable inspect output: {}", e);
            None
        }
    }
}

#[async_trait]
impl ProcessRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, spec), fields(container = %spec.name, port = spec.port))]
    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessHandle, RuntimeError> {
        tokio::fs::create_dir_all(&spec.data_dir).await?;
        if let Some(network) = &self.settings.network {
            self.ensure_network(network).await?;
        }

        // A container left over from a crash would block the name.
        if self.inspect(&spec.name).await.is_some() {
            debug!("Removing stale container {}", spec.name);
            self.remove(&spec.name).await?;
        }

        self.launch_command(spec)
            .execute()
            .await
            .map_err(|e| docker_error("run", &e))?;
        info!("Started container {}", spec.name);
        Ok(ProcessHandle {
            id: spec.name.clone(),
            port: spec.port,
        })
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        let output = StopCommand::new(handle.id.as_str())
            .execute()
            .await
            .map_err(|e| docker_error("stop", &e))?;
        if !output.is_success() {
            debug!("Container {} might already be stopped: {}", handle.id, output.stderr);
        }
        Ok(())
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        self.remove(&handle.id).await
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> Result<bool, RuntimeError> {
        Ok(self.inspect(&handle.id).await.unwrap_or(false))
    }

    async fn ready(&self, handle: &ProcessHandle) -> bool {
        match self.settings.readiness {
            ReadinessProbe::Postgres => probe::postgres_ready(handle.port).await,
            ReadinessProbe::Tcp => probe::accepts_connections(handle.port).await,
        }
    }
}
