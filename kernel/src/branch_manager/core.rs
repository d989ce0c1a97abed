//! Core branch manager.
//!
//! Orchestrates the volume driver, the branch store, the process supervisor
//! and the route table. Structural operations on a project hold that
//! project's lock for their whole duration; filesystem and process work run
//! outside store transactions, and each state change is committed on its own.

use chrono::Utc;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::error::{BranchError, ErrorKind};
use super::ports::PortAllocator;
use super::status::{BranchReport, ProjectStatus, ProjectSummary};
use crate::domain::{
    children_first, data_dir_of, Branch, BranchName, BranchState, Project, ProjectName,
};
use crate::events::{BranchEvent, EventBus};
use crate::infrastructure::config::{PortSettings, Settings};
use crate::proxy::{Route, RouteTable};
use crate::store::{BranchStore, StoreError};
use crate::supervisor::{ProcessHandle, ProcessHealth, ProcessSupervisor};
use crate::volume::{device_path, VolumeDriver, VolumeError, VolumeHandle};

const OPERATIONS_TOTAL: &str = "dbranch_branch_operations_total";

/// Tunables of the branch manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory holding project volumes and their mount points.
    pub mount_root: PathBuf,
    /// Size recorded for new volumes.
    pub volume_size_bytes: u64,
    /// Attempts for mount and unmount.
    pub mount_retries: u32,
    /// Pause between mount attempts.
    pub retry_backoff: Duration,
    /// Proxy port for projects initialised without one.
    pub default_proxy_port: u16,
    /// Branch port range.
    pub ports: PortSettings,
    /// Host the branch databases are reached on.
    pub backend_host: IpAddr,
    /// Fallback when the store has no default project.
    pub default_project: Option<ProjectName>,
}

impl ManagerOptions {
    /// Derives options from loaded settings.
    ///
    /// # Errors
    ///
    /// Fails if `default_project` is not a valid project name.
    pub fn from_settings(settings: &Settings) -> Result<Self, BranchError> {
        Ok(Self {
            mount_root: settings.volume.mount_root.clone(),
            volume_size_bytes: settings.volume.default_size_bytes,
            mount_retries: settings.volume.mount_retries,
            retry_backoff: settings.volume.retry_backoff(),
            default_proxy_port: settings.proxy.default_port,
            ports: settings.ports.clone(),
            backend_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            default_project: settings
                .default_project
                .as_deref()
                .map(ProjectName::new)
                .transpose()?,
        })
    }
}

/// Manager for project and branch operations.
#[derive(Debug)]
pub struct BranchManager {
    store: Arc<BranchStore>,
    volumes: Arc<dyn VolumeDriver>,
    supervisor: ProcessSupervisor,
    routes: RouteTable,
    events: EventBus,
    ports: PortAllocator,
    options: ManagerOptions,
}

impl BranchManager {
    /// Creates a manager with a fresh route table and event bus.
    #[must_use]
    pub fn new(
        store: Arc<BranchStore>,
        volumes: Arc<dyn VolumeDriver>,
        supervisor: ProcessSupervisor,
        options: ManagerOptions,
    ) -> Self {
        Self {
            store,
            volumes,
            supervisor,
            routes: RouteTable::new(),
            events: EventBus::new(),
            ports: PortAllocator::new(&options.ports),
            options,
        }
    }

    /// Route table read by the proxy.
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Event bus carrying lifecycle events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<BranchStore> {
        &self.store
    }

    /// Creates the project volume, its `main` branch, and makes `main` active.
    ///
    /// # Errors
    ///
    /// [`BranchError::AlreadyInitialized`] if the project exists,
    /// [`BranchError::PortInUse`] if the proxy port is taken, or a volume or
    /// store failure (the volume is removed again in that case).
    #[instrument(skip_all, fields(project = %name))]
    pub async fn init(
        &self,
        name: &ProjectName,
        proxy_port: Option<u16>,
    ) -> Result<Project, BranchError> {
        let result: Result<Project, BranchError> = async {
            let _guard = self.store.lock_project(name).await;
            match self.store.get_project(name).await {
                Ok(_) => return Err(BranchError::AlreadyInitialized(name.clone())),
                Err(StoreError::ProjectNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let proxy_port = proxy_port.unwrap_or(self.options.default_proxy_port);
            let mut taken = self.store.allocated_ports().await?;
            if !taken.insert(proxy_port) {
                return Err(BranchError::PortInUse(proxy_port));
            }
            let port = self.ports.reserve(&taken)?;

            let main = BranchName::main();
            let device = device_path(&self.options.mount_root, name.as_str());
            let mount_point = self.options.mount_root.join(name.as_str());
            self.emit_state(name, &main, BranchState::Uninitialized, BranchState::Creating);

            let volume = {
                let volumes = Arc::clone(&self.volumes);
                let (device, mount_point) = (device.clone(), mount_point.clone());
                let size = self.options.volume_size_bytes;
                blocking(move || volumes.create_volume(&device, &mount_point, size)).await?
            };

            let registered: Result<(Project, Branch), BranchError> = async {
                self.mount(&device, &mount_point).await?;
                let root = mount_point.join(main.as_str());
                {
                    let volumes = Arc::clone(&self.volumes);
                    let root = root.clone();
                    blocking(move || {
                        volumes.create_subvolume(&root)?;
                        create_data_dir(&root)
                    })
                    .await?;
                }

                let now = Utc::now();
                let project = Project {
                    name: name.clone(),
                    device: device.clone(),
                    mount_point: mount_point.clone(),
                    proxy_port,
                    active_branch: main.clone(),
                    created_at: now,
                };
                let branch = Branch {
                    project: name.clone(),
                    name: main.clone(),
                    parent: None,
                    snapshot_path: root,
                    port: port.port(),
                    state: BranchState::Stopped,
                    process_ref: None,
                    created_at: now,
                };
                self.store.create_project(&project, &branch).await?;
                Ok((project, branch))
            }
            .await;

            let (project, branch) = match registered {
                Ok(done) => done,
                Err(e) => {
                    let volumes = Arc::clone(&self.volumes);
                    if let Err(cleanup) = blocking(move || volumes.delete_volume(&volume)).await {
                        warn!("Failed to remove volume of failed init: {}", cleanup);
                    }
                    self.emit_state(name, &main, BranchState::Creating, BranchState::Failed);
                    return Err(e);
                }
            };

            if self.store.default_project().await?.is_none() {
                self.store.set_default_project(Some(name)).await?;
            }

            self.emit_state(name, &main, BranchState::Creating, BranchState::Stopped);
            self.events.publish(BranchEvent::ProjectInitialized {
                project: name.clone(),
                proxy_port,
            });
            info!(port = branch.port, proxy_port, "Project initialized");
            Ok(project)
        }
        .await;
        record_op("init", &result);
        result
    }

    /// Snapshots `source` (default: the active branch) into a new branch.
    ///
    /// The branch is recorded as `creating` with its port before the snapshot
    /// is taken, then moves to `stopped`, or to `failed` when the snapshot
    /// fails. The active branch is unchanged.
    ///
    /// # Errors
    ///
    /// [`BranchError::DuplicateBranchName`], [`BranchError::PortExhausted`],
    /// [`BranchError::BranchNotFound`] for a missing source, or
    /// [`BranchError::ProjectStopped`].
    #[instrument(skip_all, fields(project = %project, branch = %name))]
    pub async fn create(
        &self,
        project: &ProjectName,
        name: &BranchName,
        source: Option<&BranchName>,
    ) -> Result<Branch, BranchError> {
        let result: Result<Branch, BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            let source = source.unwrap_or(&proj.active_branch).clone();
            let parent = self.store.get_branch(project, &source).await?;
            if matches!(parent.state, BranchState::Deleting | BranchState::Deleted) {
                return Err(BranchError::InvalidState {
                    project: project.clone(),
                    branch: source,
                    state: parent.state,
                    op: "snapshot",
                });
            }
            match self.store.get_branch(project, name).await {
                Ok(_) => {
                    return Err(BranchError::DuplicateBranchName {
                        project: project.clone(),
                        branch: name.clone(),
                    })
                }
                Err(StoreError::BranchNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            self.ensure_mounted(&proj)?;

            let port = self.ports.reserve(&self.store.allocated_ports().await?)?;
            let dest = proj.subvolume_path(name);
            let mut branch = Branch {
                project: project.clone(),
                name: name.clone(),
                parent: Some(source.clone()),
                snapshot_path: dest.clone(),
                port: port.port(),
                state: BranchState::Creating,
                process_ref: None,
                created_at: Utc::now(),
            };
            // Recorded before the copy starts: the port is held and the
            // source cannot be deleted underneath the snapshot.
            self.store.record_branch(&branch).await?;
            self.emit_state(project, name, BranchState::Uninitialized, BranchState::Creating);

            let snapshot = {
                let volumes = Arc::clone(&self.volumes);
                let (from, to) = (parent.snapshot_path.clone(), dest);
                blocking(move || volumes.snapshot(&from, &to)).await
            };
            let snapshot = match snapshot {
                Ok(s) => s,
                Err(e) => {
                    warn!("Snapshot failed: {}", e);
                    if let Err(t) = self.transition(&mut branch, BranchState::Failed).await {
                        warn!("Failed to record snapshot failure: {}", t);
                    }
                    return Err(e);
                }
            };
            self.transition(&mut branch, BranchState::Stopped).await?;

            self.events.publish(BranchEvent::BranchCreated {
                project: project.clone(),
                branch: name.clone(),
                parent: source,
                port: branch.port,
            });
            info!(
                port = branch.port,
                reflinked = snapshot.reflinked_files,
                copied = snapshot.copied_files,
                "Branch created"
            );
            Ok(branch)
        }
        .await;
        record_op("create", &result);
        result
    }

    /// Makes `branch` the active branch, starting its database if needed.
    ///
    /// The active pointer moves and the route is published only once the
    /// database accepts connections. On startup failure the branch becomes
    /// `failed` and the active branch is unchanged.
    ///
    /// # Errors
    ///
    /// [`BranchError::BranchNotReady`] on startup failure,
    /// [`BranchError::InvalidState`] for failed or deleting targets.
    #[instrument(skip_all, fields(project = %project, branch = %branch))]
    pub async fn use_branch(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<Branch, BranchError> {
        let result: Result<Branch, BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            let mut target = self.store.get_branch(project, branch).await?;
            if matches!(
                target.state,
                BranchState::Failed | BranchState::Deleting | BranchState::Deleted
            ) {
                return Err(BranchError::InvalidState {
                    project: project.clone(),
                    branch: branch.clone(),
                    state: target.state,
                    op: "use",
                });
            }
            self.ensure_mounted(&proj)?;
            self.ensure_running(&mut target).await?;

            if proj.active_branch != target.name {
                self.store.set_active(project, &target.name).await?;
                self.events.publish(BranchEvent::BranchSwitched {
                    project: project.clone(),
                    from: proj.active_branch.clone(),
                    to: target.name.clone(),
                });
                info!(from = %proj.active_branch, "Switched active branch");
            }
            self.publish_route(project, &target);
            Ok(target)
        }
        .await;
        record_op("use", &result);
        result
    }

    /// Stops every branch database of the project and unmounts its volume.
    ///
    /// # Errors
    ///
    /// Returns the first process stop failure (the volume then stays
    /// mounted), or an unmount failure after retries.
    #[instrument(skip_all, fields(project = %project))]
    pub async fn stop_project(&self, project: &ProjectName) -> Result<(), BranchError> {
        let result: Result<(), BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            self.withdraw_route(project);

            let mut first_error = None;
            for mut branch in self.store.list_branches(project).await? {
                if let Err(e) = self.stop_process(&mut branch).await {
                    warn!(branch = %branch.name, "Failed to stop: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            self.unmount(&proj.mount_point).await?;
            info!("Project stopped");
            Ok(())
        }
        .await;
        record_op("stop", &result);
        result
    }

    /// Mounts the project volume and starts every stopped branch.
    ///
    /// Branches that fail to start become `failed`; the others keep going.
    ///
    /// # Errors
    ///
    /// Fails on mount failure, or with [`BranchError::BranchNotReady`] if the
    /// active branch could not be started.
    #[instrument(skip_all, fields(project = %project))]
    pub async fn resume_project(&self, project: &ProjectName) -> Result<Vec<Branch>, BranchError> {
        let result: Result<Vec<Branch>, BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            self.mount(&proj.device, &proj.mount_point).await?;

            let mut active_error = None;
            for mut branch in self.store.list_branches(project).await? {
                if !matches!(branch.state, BranchState::Stopped | BranchState::Running) {
                    continue;
                }
                match self.ensure_running(&mut branch).await {
                    Ok(()) if branch.name == proj.active_branch => {
                        self.publish_route(project, &branch);
                    }
                    Ok(()) => {}
                    Err(e) => {
                        warn!(branch = %branch.name, "Failed to resume: {}", e);
                        if branch.name == proj.active_branch {
                            active_error = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = active_error {
                return Err(e);
            }
            info!("Project resumed");
            Ok(self.store.list_branches(project).await?)
        }
        .await;
        record_op("resume", &result);
        result
    }

    /// Deletes a branch: stops its database, removes its snapshot and record.
    ///
    /// Snapshots are independent of their source once taken, so finished
    /// children survive and are re-parented to this branch's parent.
    ///
    /// # Errors
    ///
    /// [`BranchError::ActiveBranch`] for the active branch and
    /// [`BranchError::HasDependents`] while a child is still being created
    /// from it; nothing is changed in either case.
    #[instrument(skip_all, fields(project = %project, branch = %branch))]
    pub async fn delete_branch(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<(), BranchError> {
        let result: Result<(), BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            let mut target = self.store.get_branch(project, branch).await?;

            if proj.active_branch == target.name {
                return Err(BranchError::ActiveBranch {
                    project: project.clone(),
                    branch: branch.clone(),
                });
            }
            let children: Vec<String> = self
                .store
                .list_branches(project)
                .await?
                .iter()
                .filter(|b| {
                    b.is_child_of(branch)
                        && matches!(b.state, BranchState::Uninitialized | BranchState::Creating)
                })
                .map(|b| b.name.to_string())
                .collect();
            if !children.is_empty() {
                return Err(BranchError::HasDependents {
                    project: project.clone(),
                    branch: branch.clone(),
                    children,
                });
            }
            if !matches!(
                target.state,
                BranchState::Stopped
                    | BranchState::Running
                    | BranchState::Failed
                    | BranchState::Deleting
            ) {
                return Err(BranchError::InvalidState {
                    project: project.clone(),
                    branch: branch.clone(),
                    state: target.state,
                    op: "delete",
                });
            }

            self.stop_process(&mut target).await?;
            if target.state != BranchState::Deleting {
                self.transition(&mut target, BranchState::Deleting).await?;
            }

            let path = target.snapshot_path.clone();
            let volumes = Arc::clone(&self.volumes);
            if let Err(e) = blocking(move || volumes.delete_subvolume(&path)).await {
                if let Err(rollback) = self.transition(&mut target, BranchState::Stopped).await {
                    warn!("Failed to roll back deleting state: {}", rollback);
                }
                return Err(e);
            }

            self.store.remove_branch(project, branch).await?;
            self.emit_state(project, branch, BranchState::Deleting, BranchState::Deleted);
            self.events.publish(BranchEvent::BranchDeleted {
                project: project.clone(),
                branch: branch.clone(),
                port: target.port,
            });
            info!(port = target.port, "Branch deleted");
            Ok(())
        }
        .await;
        record_op("delete", &result);
        result
    }

    /// Deletes every branch (children before parents), then the volume and
    /// the project record.
    ///
    /// A failure part-way leaves the remaining branches in `deleting`; the
    /// operation can be retried.
    ///
    /// # Errors
    ///
    /// Returns the first process, volume or store failure.
    #[instrument(skip_all, fields(project = %project))]
    pub async fn delete_project(&self, project: &ProjectName) -> Result<(), BranchError> {
        let result: Result<(), BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            self.withdraw_route(project);

            let branches = children_first(&self.store.list_branches(project).await?);
            for mut branch in branches {
                self.stop_process(&mut branch).await?;
                if branch.state.can_transition_to(BranchState::Deleting) {
                    self.transition(&mut branch, BranchState::Deleting).await?;
                } else if branch.state != BranchState::Deleting {
                    debug!(branch = %branch.name, state = %branch.state, "Deleting without transition");
                }
                let path = branch.snapshot_path.clone();
                let volumes = Arc::clone(&self.volumes);
                blocking(move || volumes.delete_subvolume(&path)).await?;
                self.emit_state(project, &branch.name, BranchState::Deleting, BranchState::Deleted);
            }

            let volume = VolumeHandle {
                device: proj.device.clone(),
                mount_point: proj.mount_point.clone(),
                size_bytes: self.options.volume_size_bytes,
            };
            let volumes = Arc::clone(&self.volumes);
            blocking(move || volumes.delete_volume(&volume)).await?;

            self.store.delete_project(project).await?;
            self.events.publish(BranchEvent::ProjectDeleted {
                project: project.clone(),
            });
            info!("Project deleted");
            Ok(())
        }
        .await;
        record_op("delete_project", &result);
        result
    }

    /// Returns a `failed` (or interrupted `starting`/`stopping`) branch to
    /// `stopped`, making sure no process is left behind.
    ///
    /// # Errors
    ///
    /// [`BranchError::InvalidState`] for branches in any other state, and for
    /// branches whose snapshot was never written; those can only be deleted.
    #[instrument(skip_all, fields(project = %project, branch = %branch))]
    pub async fn reset_branch(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<Branch, BranchError> {
        let result: Result<Branch, BranchError> = async {
            let _guard = self.store.lock_project(project).await;
            let proj = self.store.get_project(project).await?;
            let mut target = self.store.get_branch(project, branch).await?;
            let snapshot_missing = self.volumes.is_mounted(&proj.mount_point)
                && !target.snapshot_path.exists();
            if !matches!(
                target.state,
                BranchState::Failed | BranchState::Starting | BranchState::Stopping
            ) || snapshot_missing
            {
                return Err(BranchError::InvalidState {
                    project: project.clone(),
                    branch: branch.clone(),
                    state: target.state,
                    op: "reset",
                });
            }

            if let Some(handle) = ProcessHandle::of(&target) {
                if let Err(e) = self.supervisor.stop(&handle).await {
                    warn!("Leftover process could not be stopped: {}", e);
                }
                self.clear_process(&mut target).await?;
            }
            if target.state == BranchState::Starting {
                self.transition(&mut target, BranchState::Failed).await?;
            }
            self.transition(&mut target, BranchState::Stopped).await?;
            info!("Branch reset");
            Ok(target)
        }
        .await;
        record_op("reset", &result);
        result
    }

    /// Project overview with live health and sizes.
    ///
    /// # Errors
    ///
    /// [`BranchError::ProjectNotFound`] or a store failure.
    pub async fn status(&self, project: &ProjectName) -> Result<ProjectStatus, BranchError> {
        let proj = self.store.get_project(project).await?;
        let mounted = self.volumes.is_mounted(&proj.mount_point);
        let mut branches = Vec::new();
        for branch in self.store.list_branches(project).await? {
            branches.push(self.report(&branch, &proj, mounted).await);
        }
        Ok(ProjectStatus {
            project: proj.name.clone(),
            proxy_port: proj.proxy_port,
            active_branch: proj.active_branch.clone(),
            mounted,
            mount_point: proj.mount_point.clone(),
            branches,
            created_at: proj.created_at,
        })
    }

    /// Details of one branch.
    ///
    /// # Errors
    ///
    /// [`BranchError::ProjectNotFound`] or [`BranchError::BranchNotFound`].
    pub async fn show(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<BranchReport, BranchError> {
        let proj = self.store.get_project(project).await?;
        let branch = self.store.get_branch(project, branch).await?;
        let mounted = self.volumes.is_mounted(&proj.mount_point);
        Ok(self.report(&branch, &proj, mounted).await)
    }

    /// All projects.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    pub async fn list_projects(&self) -> Result<Vec<ProjectSummary>, BranchError> {
        let default = self.default_project().await?;
        Ok(self
            .store
            .list_projects()
            .await?
            .iter()
            .map(|p| ProjectSummary::new(p, default.as_ref() == Some(&p.name)))
            .collect())
    }

    /// Branches of a project, oldest first.
    ///
    /// # Errors
    ///
    /// [`BranchError::ProjectNotFound`] or a store failure.
    pub async fn list_branches(&self, project: &ProjectName) -> Result<Vec<Branch>, BranchError> {
        Ok(self.store.list_branches(project).await?)
    }

    /// Makes `project` the default for commands that name none.
    ///
    /// # Errors
    ///
    /// [`BranchError::ProjectNotFound`] if it does not exist.
    #[instrument(skip(self))]
    pub async fn set_default(&self, project: &ProjectName) -> Result<(), BranchError> {
        self.store.set_default_project(Some(project)).await?;
        info!("Default project set");
        Ok(())
    }

    /// The stored default project, falling back to the configured one.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    pub async fn default_project(&self) -> Result<Option<ProjectName>, BranchError> {
        Ok(self
            .store
            .default_project()
            .await?
            .or_else(|| self.options.default_project.clone()))
    }

    /// `project` if given, otherwise the default project.
    ///
    /// # Errors
    ///
    /// [`BranchError::NoDefaultProject`] if neither exists.
    pub async fn resolve_project(
        &self,
        project: Option<ProjectName>,
    ) -> Result<ProjectName, BranchError> {
        match project {
            Some(p) => Ok(p),
            None => self
                .default_project()
                .await?
                .ok_or(BranchError::NoDefaultProject),
        }
    }

    /// Rebuilds the route table from the store and live health checks.
    ///
    /// Running branches whose process has exited are marked `stopped`.
    /// Returns the number of published routes.
    ///
    /// # Errors
    ///
    /// Returns a store failure while listing projects.
    #[instrument(skip(self))]
    pub async fn reconcile_routes(&self) -> Result<usize, BranchError> {
        let projects = self.store.list_projects().await?;
        let known: HashSet<&ProjectName> = projects.iter().map(|p| &p.name).collect();
        for (name, _) in self.routes.snapshot() {
            if !known.contains(&name) {
                self.withdraw_route(&name);
            }
        }

        let mut published = 0;
        for proj in &projects {
            let _guard = self.store.lock_project(&proj.name).await;
            // Re-read under the lock; a switch may have landed since listing.
            let (proj, branches) = match self.project_snapshot(&proj.name).await {
                Ok(found) => found,
                Err(StoreError::ProjectNotFound(_)) => {
                    self.withdraw_route(&proj.name);
                    continue;
                }
                Err(e) => {
                    warn!(project = %proj.name, "Skipping reconcile: {}", e);
                    continue;
                }
            };

            let mut active_running = false;
            for branch in branches.iter().filter(|b| b.state == BranchState::Running) {
                let health = match ProcessHandle::of(branch) {
                    Some(handle) => self.supervisor.health_check(&handle).await,
                    None => ProcessHealth::Stopped,
                };
                match health {
                    ProcessHealth::Running => {
                        if branch.name == proj.active_branch {
                            self.publish_route(&proj.name, branch);
                            active_running = true;
                        }
                    }
                    ProcessHealth::Stopped => self.record_exit(branch).await,
                    ProcessHealth::Failed => {}
                }
            }

            if active_running {
                published += 1;
            } else {
                self.withdraw_route(&proj.name);
            }
        }
        Ok(published)
    }

    async fn project_snapshot(
        &self,
        project: &ProjectName,
    ) -> Result<(Project, Vec<Branch>), StoreError> {
        let proj = self.store.get_project(project).await?;
        let branches = self.store.list_branches(project).await?;
        Ok((proj, branches))
    }

    /// Marks a `running` branch whose process is gone as `stopped`.
    /// The caller holds the project lock.
    async fn record_exit(&self, seen: &Branch) {
        let Ok(mut branch) = self.store.get_branch(&seen.project, &seen.name).await else {
            return;
        };
        if branch.state != BranchState::Running || branch.process_ref != seen.process_ref {
            return;
        }
        warn!(project = %branch.project, branch = %branch.name, "Database process exited");
        if let Err(e) = self.transition(&mut branch, BranchState::Stopped).await {
            warn!("Failed to record exit: {}", e);
            return;
        }
        if let Err(e) = self.clear_process(&mut branch).await {
            warn!("Failed to clear process reference: {}", e);
        }
    }

    async fn report(&self, branch: &Branch, project: &Project, mounted: bool) -> BranchReport {
        let health = match ProcessHandle::of(branch) {
            Some(handle) => Some(self.supervisor.health_check(&handle).await),
            None => None,
        };
        let usage = if mounted {
            let volumes = Arc::clone(&self.volumes);
            let path = branch.snapshot_path.clone();
            blocking(move || volumes.usage(&path)).await.ok()
        } else {
            None
        };
        BranchReport::new(branch, project.active_branch == branch.name, health, usage)
    }

    /// Starts the branch database unless it is already up.
    async fn ensure_running(&self, branch: &mut Branch) -> Result<(), BranchError> {
        match branch.state {
            BranchState::Running => {
                if let Some(handle) = ProcessHandle::of(branch) {
                    if self.supervisor.health_check(&handle).await == ProcessHealth::Running {
                        return Ok(());
                    }
                }
                warn!(branch = %branch.name, "Recorded as running but process is gone");
                self.transition(branch, BranchState::Stopped).await?;
                self.clear_process(branch).await?;
            }
            BranchState::Stopped => {}
            state => {
                return Err(BranchError::InvalidState {
                    project: branch.project.clone(),
                    branch: branch.name.clone(),
                    state,
                    op: "start",
                })
            }
        }

        self.transition(branch, BranchState::Starting).await?;
        let handle = match self.supervisor.start(branch).await {
            Ok(handle) => handle,
            Err(source) => {
                if let Err(e) = self.transition(branch, BranchState::Failed).await {
                    warn!("Failed to record startup failure: {}", e);
                }
                return Err(BranchError::BranchNotReady {
                    project: branch.project.clone(),
                    branch: branch.name.clone(),
                    source,
                });
            }
        };

        if let Err(e) = self
            .store
            .set_process_ref(&branch.project, &branch.name, Some(&handle.id))
            .await
        {
            // Unrecorded processes would be unreachable for stop; tear it down.
            if let Err(stop) = self.supervisor.stop(&handle).await {
                warn!("Failed to stop unrecorded process: {}", stop);
            }
            if let Err(t) = self.transition(branch, BranchState::Failed).await {
                warn!("Failed to record startup failure: {}", t);
            }
            return Err(e.into());
        }
        branch.process_ref = Some(handle.id);
        self.transition(branch, BranchState::Running).await
    }

    /// Stops the branch process if it has one; `running` branches end `stopped`.
    async fn stop_process(&self, branch: &mut Branch) -> Result<(), BranchError> {
        let handle = ProcessHandle::of(branch);
        if branch.state == BranchState::Running {
            self.transition(branch, BranchState::Stopping).await?;
            if let Some(handle) = &handle {
                self.supervisor.stop(handle).await?;
            }
            self.clear_process(branch).await?;
            return self.transition(branch, BranchState::Stopped).await;
        }

        if let Some(handle) = &handle {
            if let Err(e) = self.supervisor.stop(handle).await {
                warn!(branch = %branch.name, "Leftover process could not be stopped: {}", e);
            }
            self.clear_process(branch).await?;
        }
        if branch.state == BranchState::Stopping {
            return self.transition(branch, BranchState::Stopped).await;
        }
        Ok(())
    }

    async fn clear_process(&self, branch: &mut Branch) -> Result<(), BranchError> {
        self.store
            .set_process_ref(&branch.project, &branch.name, None)
            .await?;
        branch.process_ref = None;
        Ok(())
    }

    async fn transition(&self, branch: &mut Branch, to: BranchState) -> Result<(), BranchError> {
        let from = self
            .store
            .update_branch_status(&branch.project, &branch.name, to)
            .await?;
        branch.state = to;
        self.emit_state(&branch.project, &branch.name, from, to);
        Ok(())
    }

    fn emit_state(&self, project: &ProjectName, branch: &BranchName, from: BranchState, to: BranchState) {
        debug!(branch = %branch, %from, %to, "State change");
        self.events.publish(BranchEvent::StateChanged {
            project: project.clone(),
            branch: branch.clone(),
            from,
            to,
        });
    }

    fn publish_route(&self, project: &ProjectName, branch: &Branch) {
        let route = Route {
            branch: branch.name.clone(),
            backend: SocketAddr::new(self.options.backend_host, branch.port),
        };
        if self.routes.resolve(project).as_deref() == Some(&route) {
            return;
        }
        let backend = route.backend;
        self.routes.publish(project, route);
        info!(project = %project, branch = %branch.name, %backend, "Route published");
        self.events.publish(BranchEvent::RoutePublished {
            project: project.clone(),
            branch: branch.name.clone(),
            backend,
        });
    }

    fn withdraw_route(&self, project: &ProjectName) {
        if self.routes.withdraw(project).is_some() {
            info!(project = %project, "Route withdrawn");
            self.events.publish(BranchEvent::RouteWithdrawn {
                project: project.clone(),
            });
        }
    }

    fn ensure_mounted(&self, project: &Project) -> Result<(), BranchError> {
        if self.volumes.is_mounted(&project.mount_point) {
            Ok(())
        } else {
            Err(BranchError::ProjectStopped(project.name.clone()))
        }
    }

    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), BranchError> {
        let (device, mount_point) = (device.to_path_buf(), mount_point.to_path_buf());
        self.retry_volume_op("mount", move |volumes| volumes.mount(&device, &mount_point))
            .await
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), BranchError> {
        let mount_point = mount_point.to_path_buf();
        self.retry_volume_op("unmount", move |volumes| volumes.unmount(&mount_point))
            .await
    }

    /// Runs a mount-class operation, retrying dependency failures.
    async fn retry_volume_op<F>(&self, what: &'static str, op: F) -> Result<(), BranchError>
    where
        F: Fn(&dyn VolumeDriver) -> Result<(), VolumeError> + Clone + Send + 'static,
    {
        let attempts = self.options.mount_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let volumes = Arc::clone(&self.volumes);
            let op = op.clone();
            match blocking(move || op(volumes.as_ref())).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && e.kind() == ErrorKind::Dependency => {
                    warn!(attempt, attempts, "{} failed, retrying: {}", what, e);
                    tokio::time::sleep(self.options.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BranchError>
where
    F: FnOnce() -> Result<T, VolumeError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

fn create_data_dir(subvolume: &Path) -> Result<(), VolumeError> {
    let data = data_dir_of(subvolume);
    std::fs::create_dir(&data).map_err(VolumeError::io("create data dir", &data))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o700))
            .map_err(VolumeError::io("chmod", &data))?;
    }
    Ok(())
}

fn record_op<T>(op: &'static str, result: &Result<T, BranchError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}
