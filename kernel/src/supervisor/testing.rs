//! In-process stand-in for branch databases.
//!
//! Each "process" is a TCP listener on the branch port that answers every
//! line with `<name> <line>`, so a client can tell which branch served it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

use super::runtime::{LaunchSpec, ProcessHandle, ProcessRuntime, RuntimeError};

/// [`ProcessRuntime`] serving tagged echo backends on loopback.
#[derive(Debug, Default)]
pub struct LoopbackRuntime {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    unresponsive: Mutex<HashSet<String>>,
    launches: AtomicU64,
}

impl LoopbackRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes future launches of `name` start but never listen, so readiness times out.
    pub fn make_unresponsive(&self, name: &str) {
        self.unresponsive.lock().insert(name.to_string());
    }

    /// Undoes [`Self::make_unresponsive`].
    pub fn make_responsive(&self, name: &str) {
        self.unresponsive.lock().remove(name);
    }

    /// Simulates the process dying on its own.
    pub fn crash(&self, handle: &ProcessHandle) {
        if let Some(task) = self.tasks.lock().get(&handle.id) {
            task.abort();
        }
    }

    /// Number of handles currently alive.
    #[must_use]
    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Total launches so far.
    #[must_use]
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

}

async fn serve(listener: TcpListener, label: String) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(answer(stream, label.clone()));
    }
}

async fn answer(stream: TcpStream, label: String) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if write
            .write_all(format!("{label} {line}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

#[async_trait]
impl ProcessRuntime for LoopbackRuntime {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessHandle, RuntimeError> {
        let n = self.launches.fetch_add(1, Ordering::Relaxed);
        let id = format!("loopback-{}-{n}", spec.name);

        let task = if self.unresponsive.lock().contains(&spec.name) {
            tokio::spawn(std::future::pending::<()>())
        } else {
            let listener = TcpListener::bind(("127.0.0.1", spec.port)).await?;
            tokio::spawn(serve(listener, spec.name.clone()))
        };
        debug!("Loopback backend {} on port {}", id, spec.port);

        self.tasks.lock().insert(id.clone(), task);
        Ok(ProcessHandle {
            id,
            port: spec.port,
        })
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        if let Some(task) = self.tasks.lock().get(&handle.id) {
            task.abort();
        }
        Ok(())
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        let task = self.tasks.lock().remove(&handle.id);
        if let Some(task) = task {
            task.abort();
            // Wait for the listener to be dropped so the port is free again.
            let _ = task.await;
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> Result<bool, RuntimeError> {
        Ok(self
            .tasks
            .lock()
            .get(&handle.id)
            .is_some_and(|task| !task.is_finished()))
    }
}
