//! Volume driver configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for project volumes and their subvolumes.
#[derive(Debug, Deserialize, Clone)]
pub struct VolumeSettings {
    /// Directory under which every project volume is mounted.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Size recorded for new volumes (default: 1 TiB).
    #[serde(default = "default_size_bytes")]
    pub default_size_bytes: u64,
    /// Fail instead of falling back to a byte copy when reflinks are unsupported.
    #[serde(default)]
    pub require_reflink: bool,
    /// Attempts for mount and unmount before giving up (default: 3).
    #[serde(default = "default_mount_retries")]
    pub mount_retries: u32,
    /// Pause between mount attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl VolumeSettings {
    /// Pause between mount attempts.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            default_size_bytes: default_size_bytes(),
            require_reflink: false,
            mount_retries: default_mount_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/dbranch")
}

fn default_size_bytes() -> u64 {
    1024 * 1024 * 1024 * 1024
}

fn default_mount_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}
