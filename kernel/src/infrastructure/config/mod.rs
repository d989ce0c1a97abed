//! Configuration management for dbranch.
//!
//! Settings are layered: built-in defaults, then an optional config file
//! (`DBRANCH_CONFIG`, default `dbranch.{toml,yaml,json}` in the working
//! directory), then `DBRANCH__SECTION__KEY` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use dbranch_kernel::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! assert_eq!(settings.proxy.default_port, 5432);
//! ```

pub mod database;
pub mod ports;
pub mod proxy;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod volume;

pub use database::DatabaseSettings;
pub use ports::PortSettings;
pub use proxy::ProxySettings;
pub use server::ServerSettings;
pub use supervisor::{ReadinessProbe, RuntimeKind, SupervisorSettings};
pub use telemetry::TelemetrySettings;
pub use volume::VolumeSettings;

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

const ENV_CONFIG_PATH: &str = "DBRANCH_CONFIG";
const DEFAULT_CONFIG_STEM: &str = "dbranch";

/// Top-level configuration for dbranch.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Control plane settings.
    pub server: ServerSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Branch store settings.
    pub database: DatabaseSettings,
    /// Proxy router settings.
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Volume driver settings.
    #[serde(default)]
    pub volume: VolumeSettings,
    /// Branch port range.
    #[serde(default)]
    pub ports: PortSettings,
    /// Process supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    /// Project used when a command names none and the store has no default.
    #[serde(default)]
    pub default_project: Option<String>,
}

impl Settings {
    /// Loads settings from defaults, the config file named by
    /// `DBRANCH_CONFIG` (if any) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH).ok();
        Self::load(path.as_deref().map(Path::new))
    }

    /// Loads settings, reading `path` as a required config file when given.
    ///
    /// Without a path an optional `dbranch.*` file in the working
    /// directory is merged if present.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing or malformed, or the
    /// merged configuration does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = Self::defaults()?;
        let builder = match path {
            Some(p) => builder.add_source(File::from(p).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_STEM).required(false)),
        };

        builder
            .add_source(Environment::with_prefix("DBRANCH").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Builds settings from defaults overlaid with a TOML document.
    ///
    /// The environment is not consulted.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8000)?
            .set_default("telemetry.service_name", "dbranch")?
            .set_default("telemetry.sampling_ratio", telemetry::default_sampling())?
            .set_default("database.url", "sqlite://.dbranch/state.db")
    }
}

/// Helper for strong typing addresses
pub struct BindAddress(pub String, pub u16);

impl BindAddress {
    /// Converts the bind address to a `SocketAddr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the IP address string cannot be parsed.
    pub fn to_socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        let ip = self
            .0
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid IP address '{}': {e}", self.0))?;
        Ok(std::net::SocketAddr::new(ip, self.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults_fill_every_section() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.proxy.default_port, 5432);
        assert_eq!(settings.ports.min, 7000);
        assert_eq!(settings.ports.max, 7999);
        assert_eq!(settings.volume.mount_retries, 3);
        assert_eq!(settings.supervisor.runtime, RuntimeKind::Docker);
        assert_eq!(settings.supervisor.image, "postgres:17-alpine");
        assert_eq!(settings.supervisor.readiness, ReadinessProbe::Postgres);
        assert_eq!(
            settings.database.url.expose_secret(),
            "sqlite://.dbranch/state.db"
        );
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [ports]
            min = 9000
            max = 9010

            [supervisor]
            runtime = "process"
            readiness = "tcp"
            stop_grace_secs = 2

            [volume]
            mount_root = "/srv/dbranch"
            require_reflink = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.ports.min, 9000);
        assert_eq!(settings.ports.max, 9010);
        assert_eq!(settings.supervisor.runtime, RuntimeKind::Process);
        assert_eq!(settings.supervisor.readiness, ReadinessProbe::Tcp);
        assert_eq!(settings.supervisor.stop_grace().as_secs(), 2);
        assert_eq!(settings.volume.mount_root, Path::new("/srv/dbranch"));
        assert!(settings.volume.require_reflink);
        assert!(settings.ports.probe_host);
    }

    #[test]
    fn bind_address_rejects_hostnames() {
        assert!(BindAddress("localhost".into(), 80).to_socket_addr().is_err());
        let addr = BindAddress("127.0.0.1".into(), 8000)
            .to_socket_addr()
            .unwrap();
        assert_eq!(addr.port(), 8000);
    }
}
