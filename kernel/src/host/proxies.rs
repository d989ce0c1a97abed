//! One proxy listener per project.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::{Project, ProjectName};
use crate::proxy::{ProxyRouter, RouteTable};

#[derive(Debug)]
struct Listener {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Set of running [`ProxyRouter`]s, kept in line with the projects in the store.
#[derive(Debug)]
pub struct ProxyFleet {
    host: IpAddr,
    routes: RouteTable,
    connect_timeout: Duration,
    listeners: HashMap<ProjectName, Listener>,
}

impl ProxyFleet {
    /// Creates an empty fleet binding on `host`.
    #[must_use]
    pub fn new(host: IpAddr, routes: RouteTable, connect_timeout: Duration) -> Self {
        Self {
            host,
            routes,
            connect_timeout,
            listeners: HashMap::new(),
        }
    }

    /// Starts listeners for new projects and stops those of removed ones.
    ///
    /// A project whose port cannot be bound is logged and retried on the
    /// next sync.
    pub async fn sync(&mut self, projects: &[Project]) {
        let wanted: HashMap<&ProjectName, SocketAddr> = projects
            .iter()
            .map(|p| (&p.name, SocketAddr::new(self.host, p.proxy_port)))
            .collect();

        let stale: Vec<ProjectName> = self
            .listeners
            .iter()
            .filter(|(name, l)| wanted.get(name) != Some(&l.addr) || l.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(listener) = self.listeners.remove(&name) {
                stop(listener).await;
                info!(project = %name, "Proxy listener removed");
            }
        }

        for (name, addr) in wanted {
            if self.listeners.contains_key(name) {
                continue;
            }
            match ProxyRouter::bind(name.clone(), addr, self.routes.clone(), self.connect_timeout)
                .await
            {
                Ok(router) => {
                    let (stop, stopped) = watch::channel(false);
                    let task = tokio::spawn(router.serve(stopped));
                    self.listeners
                        .insert(name.clone(), Listener { addr, stop, task });
                }
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// Projects currently served, with their listen address.
    #[must_use]
    pub fn listening(&self) -> Vec<(ProjectName, SocketAddr)> {
        let mut all: Vec<_> = self
            .listeners
            .iter()
            .map(|(name, l)| (name.clone(), l.addr))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Stops every listener and waits for their accept loops to end.
    pub async fn shutdown(&mut self) {
        for (_, listener) in self.listeners.drain() {
            stop(listener).await;
        }
    }
}

async fn stop(listener: Listener) {
    let _ = listener.stop.send(true);
    if let Err(e) = listener.task.await {
        warn!("Proxy task ended abnormally: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BranchName;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn project(name: &str, proxy_port: u16) -> Project {
        Project {
            name: ProjectName::new(name).unwrap(),
            device: PathBuf::from("/dev/null"),
            mount_point: PathBuf::from("/tmp"),
            proxy_port,
            active_branch: BranchName::main(),
            created_at: Utc::now(),
        }
    }

    fn fleet() -> ProxyFleet {
        ProxyFleet::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            RouteTable::new(),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_sync_follows_project_list() {
        let mut fleet = fleet();
        let (a, b) = (free_port(), free_port());

        fleet.sync(&[project("p1", a), project("p2", b)]).await;
        assert_eq!(fleet.listening().len(), 2);
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", a)).await.is_ok());

        fleet.sync(&[project("p2", b)]).await;
        let listening = fleet.listening();
        assert_eq!(listening.len(), 1);
        assert_eq!(listening[0].0.as_str(), "p2");
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", a)).await.is_err());

        fleet.shutdown().await;
        assert!(fleet.listening().is_empty());
    }

    #[tokio::test]
    async fn test_unbindable_port_is_retried() {
        let mut fleet = fleet();
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        fleet.sync(&[project("p1", port)]).await;
        assert!(fleet.listening().is_empty());

        drop(holder);
        fleet.sync(&[project("p1", port)]).await;
        assert_eq!(fleet.listening().len(), 1);
        fleet.shutdown().await;
    }
}
