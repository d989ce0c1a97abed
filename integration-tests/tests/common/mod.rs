//! Shared test utilities for integration tests.
//!
//! Builds a full dBranch stack on a scratch directory with the in-process
//! loopback runtime standing in for database processes.

#![allow(dead_code)]

use anyhow::Result;
use dbranch_kernel::branch_manager::{BranchManager, ManagerOptions};
use dbranch_kernel::domain::{BranchName, ProjectName};
use dbranch_kernel::host::HostState;
use dbranch_kernel::infrastructure::config::Settings;
use dbranch_kernel::store::BranchStore;
use dbranch_kernel::supervisor::testing::LoopbackRuntime;
use dbranch_kernel::supervisor::ProcessSupervisor;
use dbranch_kernel::volume::ReflinkVolumeDriver;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

static NEXT_RANGE: AtomicU16 = AtomicU16::new(0);

/// Integration test context providing shared resources.
pub struct IntegrationTestContext {
    /// Scratch directory holding volumes and the store file.
    pub temp_dir: TempDir,
    /// Settings the stack was built from.
    pub settings: Settings,
    /// Loopback "database processes", shared by every manager of this context.
    pub runtime: Arc<LoopbackRuntime>,
    /// Host state around the primary manager.
    pub host: Arc<HostState>,
}

impl IntegrationTestContext {
    /// Creates a context with a file-backed store.
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let settings = test_settings(temp_dir.path())?;
        let runtime = Arc::new(LoopbackRuntime::new());
        let manager = build_manager(&settings, &runtime).await?;
        let host = Arc::new(HostState::new(Arc::new(manager), settings.clone()));
        Ok(Self {
            temp_dir,
            settings,
            runtime,
            host,
        })
    }

    /// Primary manager.
    pub fn manager(&self) -> &Arc<BranchManager> {
        self.host.manager()
    }

    /// A second manager over the same store file and runtime, standing in
    /// for another `dbranch` invocation.
    pub async fn second_manager(&self) -> Result<BranchManager> {
        build_manager(&self.settings, &self.runtime).await
    }

    /// First port of this context's branch range.
    pub fn min_port(&self) -> u16 {
        self.settings.ports.min
    }

    /// Path of a file inside the scratch directory.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp_dir.path().join(rel)
    }
}

/// Settings for a scratch stack rooted at `root`.
pub fn test_settings(root: &Path) -> Result<Settings> {
    let min = 23_000 + NEXT_RANGE.fetch_add(1, Ordering::SeqCst) * 16;
    let toml = format!(
        r#"
        [database]
        url = "sqlite://{db}"

        [proxy]
        host = "127.0.0.1"
        connect_timeout_ms = 500
        route_sync_interval_ms = 50

        [volume]
        mount_root = "{mnt}"
        mount_retries = 2
        retry_backoff_ms = 1

        [ports]
        min = {min}
        max = {max}
        probe_host = true

        [supervisor]
        startup_timeout_secs = 2
        stop_grace_secs = 1
        ready_poll_ms = 10
        "#,
        db = root.join("state.db").display(),
        mnt = root.join("mnt").display(),
        max = min + 15,
    );
    Ok(Settings::from_toml_str(&toml)?)
}

async fn build_manager(settings: &Settings, runtime: &Arc<LoopbackRuntime>) -> Result<BranchManager> {
    use secrecy::ExposeSecret;

    let store = BranchStore::connect(settings.database.url.expose_secret()).await?;
    let supervisor = ProcessSupervisor::new(runtime.clone(), &settings.supervisor);
    Ok(BranchManager::new(
        Arc::new(store),
        Arc::new(ReflinkVolumeDriver::default()),
        supervisor,
        ManagerOptions::from_settings(settings)?,
    ))
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or(0)
}

pub fn project(name: &str) -> ProjectName {
    ProjectName::new(name).unwrap()
}

pub fn branch(name: &str) -> BranchName {
    BranchName::new(name).unwrap()
}

/// An open client connection speaking the loopback line protocol.
pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    /// Connects to `127.0.0.1:port`.
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Sends one line and returns the reply without its newline.
    pub async fn ask(&mut self, line: &str) -> Result<String> {
        self.stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .await?;
        let mut reply = String::new();
        let n = self.stream.read_line(&mut reply).await?;
        anyhow::ensure!(n > 0, "connection closed");
        Ok(reply.trim_end().to_string())
    }
}

/// Retries `f` until it succeeds or `attempts` run out, sleeping `pause` in between.
pub async fn eventually<T, F, Fut>(attempts: usize, pause: std::time::Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for _ in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => last = Some(e),
        }
        tokio::time::sleep(pause).await;
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
}
