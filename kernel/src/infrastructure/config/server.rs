//! Control plane configuration.
//!
//! This module defines where the HTTP control plane binds.

use serde::Deserialize;

/// Control plane binding settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Whether `dbranch start` serves the control plane at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
