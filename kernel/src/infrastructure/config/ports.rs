//! Branch port range configuration.

use serde::Deserialize;

/// Range that branch database ports are drawn from.
#[derive(Debug, Deserialize, Clone)]
pub struct PortSettings {
    /// Lowest assignable port (inclusive).
    #[serde(default = "default_min")]
    pub min: u16,
    /// Highest assignable port (inclusive).
    #[serde(default = "default_max")]
    pub max: u16,
    /// Skip ports some other process on this host is already bound to.
    #[serde(default = "default_probe_host")]
    pub probe_host: bool,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            probe_host: default_probe_host(),
        }
    }
}

fn default_min() -> u16 {
    7000
}

fn default_max() -> u16 {
    7999
}

fn default_probe_host() -> bool {
    true
}
