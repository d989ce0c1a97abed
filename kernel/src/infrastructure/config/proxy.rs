//! Proxy router configuration.

use serde::Deserialize;
use std::time::Duration;

/// Settings for the per-project TCP proxies.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Address the proxy listeners bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Proxy port given to projects initialised without an explicit one.
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Upper bound on connecting to a branch backend, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How often the daemon rebuilds routes from the store, in milliseconds.
    #[serde(default = "default_route_sync_interval_ms")]
    pub route_sync_interval_ms: u64,
}

impl ProxySettings {
    /// Backend connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Route synchronisation interval.
    #[must_use]
    pub fn route_sync_interval(&self) -> Duration {
        Duration::from_millis(self.route_sync_interval_ms)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            default_port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            route_sync_interval_ms: default_route_sync_interval_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_route_sync_interval_ms() -> u64 {
    2_000
}
