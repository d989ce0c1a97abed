//! `dbranch start`: proxies, route sync and control plane until shutdown.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::proxies::ProxyFleet;
use super::state::HostState;
use crate::branch_manager::BranchManager;
use crate::infrastructure::{audit, server};

/// Runs the daemon until `shutdown` flips to `true`.
///
/// Every `proxy.route_sync_interval_ms` the route table is rebuilt from the
/// store, so switches made by other `dbranch` invocations reach the proxy.
///
/// # Errors
///
/// Returns an error if the proxy host is invalid, the metrics recorder
/// cannot be installed, or the control plane fails.
pub async fn run_daemon(state: Arc<HostState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let settings = state.settings();
    let manager = Arc::clone(state.manager());
    let host: IpAddr = settings
        .proxy
        .host
        .parse()
        .with_context(|| format!("Invalid proxy host '{}'", settings.proxy.host))?;

    let audit = audit::spawn_audit_listener(manager.events());
    let control_plane = if settings.server.enabled {
        let metrics = server::metrics_handle()?;
        let (state, shutdown) = (Arc::clone(&state), shutdown.clone());
        Some(tokio::spawn(server::run_server(state, metrics, shutdown)))
    } else {
        None
    };

    let mut fleet = ProxyFleet::new(
        host,
        manager.routes().clone(),
        settings.proxy.connect_timeout(),
    );
    let mut ticker = tokio::time::interval(settings.proxy.route_sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("dBranch daemon running");
    loop {
        tokio::select! {
            _ = ticker.tick() => sync_once(&manager, &mut fleet).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Stopping proxies");
    fleet.shutdown().await;
    audit.abort();
    if let Some(task) = control_plane {
        task.await.context("Control plane task panicked")??;
    }
    Ok(())
}

async fn sync_once(manager: &BranchManager, fleet: &mut ProxyFleet) {
    if let Err(e) = manager.reconcile_routes().await {
        warn!("Route sync failed: {}", e);
    }
    match manager.store().list_projects().await {
        Ok(projects) => fleet.sync(&projects).await,
        Err(e) => warn!("Failed to list projects: {}", e),
    }
}
