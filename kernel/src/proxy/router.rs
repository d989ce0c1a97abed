//! Accept loop for one project's proxy port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::relay::{relay, RelayStats};
use super::routes::{Route, RouteTable};
use crate::domain::ProjectName;

const CONNECTIONS_TOTAL: &str = "dbranch_proxy_connections_total";

/// Errors from the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("failed to bind proxy for '{project}' on {addr}")]
    Bind {
        /// Project.
        project: ProjectName,
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The project has no active route.
    #[error("no route for project '{0}'")]
    NoRoute(ProjectName),

    /// The backend did not accept the connection in time.
    #[error("backend {backend} did not accept within {timeout:?}")]
    ConnectTimeout {
        /// Backend address.
        backend: SocketAddr,
        /// Deadline.
        timeout: Duration,
    },

    /// Any other socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Listener that forwards each connection to the project's active branch.
///
/// The route is resolved once per connection; later switches only affect
/// connections accepted afterwards.
#[derive(Debug)]
pub struct ProxyRouter {
    project: ProjectName,
    listener: TcpListener,
    routes: RouteTable,
    connect_timeout: Duration,
}

impl ProxyRouter {
    /// Binds the proxy for `project` on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Bind`] if the address is unavailable.
    pub async fn bind(
        project: ProjectName,
        addr: SocketAddr,
        routes: RouteTable,
        connect_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                project: project.clone(),
                addr,
                source,
            })?;
        Ok(Self {
            project,
            listener,
            routes,
            connect_timeout,
        })
    }

    /// Address actually bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` flips to `true`.
    ///
    /// Per-connection failures are logged and never end the loop. Relays
    /// already in flight outlive the listener.
    #[instrument(skip_all, fields(project = %self.project))]
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Proxy listening on {}", addr);
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy shutting down");
                        return;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((client, peer)) => self.dispatch(client, peer),
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        // Back off on descriptor exhaustion instead of spinning.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    fn dispatch(&self, client: TcpStream, peer: SocketAddr) {
        let Some(route) = self.routes.resolve(&self.project) else {
            warn!(%peer, "No active route; closing connection");
            metrics::counter!(CONNECTIONS_TOTAL, "outcome" => "no_route").increment(1);
            drop(client);
            return;
        };

        let timeout = self.connect_timeout;
        let span = tracing::info_span!("connection", %peer, branch = %route.branch);
        tokio::spawn(
            async move {
                match forward(client, &route, timeout).await {
                    Ok(stats) => {
                        metrics::counter!(CONNECTIONS_TOTAL, "outcome" => "relayed").increment(1);
                        debug!(
                            upstream = stats.upstream,
                            downstream = stats.downstream,
                            "Connection finished"
                        );
                    }
                    Err(e) => {
                        metrics::counter!(CONNECTIONS_TOTAL, "outcome" => "failed").increment(1);
                        warn!("Connection failed: {}", e);
                    }
                }
            }
            .instrument(span),
        );
    }
}

async fn forward(
    client: TcpStream,
    route: &Arc<Route>,
    timeout: Duration,
) -> Result<RelayStats, ProxyError> {
    let backend = tokio::time::timeout(timeout, TcpStream::connect(route.backend))
        .await
        .map_err(|_| ProxyError::ConnectTimeout {
            backend: route.backend,
            timeout,
        })??;
    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);
    Ok(relay(client, backend).await?)
}
