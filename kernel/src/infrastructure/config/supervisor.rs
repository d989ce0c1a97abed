//! Process supervisor configuration.
//!
//! Selects the runtime that hosts branch databases and tunes startup and
//! shutdown timing.

use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Which process runtime backs branch databases.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// One container per branch via the `docker` CLI.
    #[default]
    Docker,
    /// One local child process per branch.
    Process,
}

/// How a started branch database is judged ready.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessProbe {
    /// PostgreSQL `SSLRequest` handshake.
    #[default]
    Postgres,
    /// Any accepted TCP connection.
    Tcp,
}

/// Process supervisor settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// Runtime used to host branch databases.
    #[serde(default)]
    pub runtime: RuntimeKind,
    /// Container image for the docker runtime.
    #[serde(default = "default_image")]
    pub image: String,
    /// Port the database listens on inside the container.
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// Optional docker network to attach containers to.
    #[serde(default)]
    pub network: Option<String>,
    /// `uid:gid` the container runs as, so files in the snapshot stay owned by the host user.
    #[serde(default)]
    pub run_as: Option<String>,
    /// Program for the process runtime.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments for the process runtime; `{data_dir}` and `{port}` are substituted.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Program run once to initialise an empty data directory (process runtime).
    #[serde(default = "default_init_program")]
    pub init_program: Option<String>,
    /// Arguments for [`Self::init_program`]; `{data_dir}` and `{user}` are substituted.
    #[serde(default = "default_init_args")]
    pub init_args: Vec<String>,
    /// Seconds to wait for a branch database to accept connections.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Seconds between the graceful signal and a forced kill.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Readiness check used while a database starts.
    #[serde(default)]
    pub readiness: ReadinessProbe,
    /// Readiness/liveness polling interval, in milliseconds.
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,
    /// Database superuser created in new containers.
    #[serde(default = "default_postgres_user")]
    pub postgres_user: String,
    /// Password for [`Self::postgres_user`].
    #[serde(default = "default_postgres_password")]
    pub postgres_password: SecretString,
    /// Database created in new containers.
    #[serde(default = "default_postgres_db")]
    pub postgres_db: String,
}

impl SupervisorSettings {
    /// Startup readiness deadline.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Graceful stop window.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Polling interval.
    #[must_use]
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            image: default_image(),
            container_port: default_container_port(),
            network: None,
            run_as: None,
            program: default_program(),
            args: default_args(),
            init_program: default_init_program(),
            init_args: default_init_args(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            readiness: ReadinessProbe::default(),
            ready_poll_ms: default_ready_poll_ms(),
            postgres_user: default_postgres_user(),
            postgres_password: default_postgres_password(),
            postgres_db: default_postgres_db(),
        }
    }
}

fn default_image() -> String {
    "postgres:17-alpine".to_string()
}

fn default_container_port() -> u16 {
    5432
}

fn default_program() -> String {
    "postgres".to_string()
}

fn default_args() -> Vec<String> {
    ["-D", "{data_dir}", "-p", "{port}", "-k", "/tmp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_init_program() -> Option<String> {
    Some("initdb".to_string())
}

fn default_init_args() -> Vec<String> {
    ["-D", "{data_dir}", "-U", "{user}", "--auth=trust"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_ready_poll_ms() -> u64 {
    200
}

fn default_postgres_user() -> String {
    "dbranch_user".to_string()
}

fn default_postgres_password() -> SecretString {
    SecretString::new("dbranch_password".into())
}

fn default_postgres_db() -> String {
    "dbranch".to_string()
}
