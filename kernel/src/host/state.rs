//! Host state management.
//!
//! `HostState` is the central coordination point shared by the CLI, the
//! daemon and the control plane handlers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use std::sync::Arc;

use crate::branch_manager::{BranchManager, ManagerOptions};
use crate::infrastructure::config::Settings;
use crate::store::BranchStore;
use crate::supervisor::{runtime_from_settings, ProcessSupervisor};
use crate::volume::ReflinkVolumeDriver;

/// The main host state.
#[derive(Debug)]
pub struct HostState {
    manager: Arc<BranchManager>,
    settings: Settings,
    started_at: DateTime<Utc>,
}

impl HostState {
    /// Opens the store and builds the manager stack described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the configured
    /// process runtime is unavailable.
    pub async fn connect(settings: Settings) -> Result<Self> {
        let store = BranchStore::connect(settings.database.url.expose_secret())
            .await
            .context("Failed to open branch store")?;
        let volumes = ReflinkVolumeDriver::new(settings.volume.require_reflink);
        let runtime = runtime_from_settings(&settings.supervisor)
            .context("Failed to set up process runtime")?;
        let supervisor = ProcessSupervisor::new(runtime, &settings.supervisor);
        let options = ManagerOptions::from_settings(&settings)?;

        let manager = BranchManager::new(Arc::new(store), Arc::new(volumes), supervisor, options);
        Ok(Self::new(Arc::new(manager), settings))
    }

    /// Wraps an already-built manager.
    #[must_use]
    pub fn new(manager: Arc<BranchManager>, settings: Settings) -> Self {
        Self {
            manager,
            settings,
            started_at: Utc::now(),
        }
    }

    /// The branch manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<BranchManager> {
        &self.manager
    }

    /// Settings this host was built from.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// When this host state was created.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
