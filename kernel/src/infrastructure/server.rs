use crate::api::project_routes;
use crate::host::HostState;
use crate::infrastructure::config::BindAddress;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::{const_mutex, Mutex};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

static METRICS: Mutex<Option<PrometheusHandle>> = const_mutex(None);

/// Installs the process-wide Prometheus recorder, or returns the one already installed.
///
/// # Errors
///
/// Returns an error if another metrics recorder was installed first.
pub fn metrics_handle() -> anyhow::Result<PrometheusHandle> {
    let mut slot = METRICS.lock();
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))?;
    *slot = Some(handle.clone());
    Ok(handle)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<Arc<HostState>>) -> (StatusCode, &'static str) {
    match state.manager().store().list_projects().await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::warn!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

/// Control plane router: health, metrics and the project API.
pub fn control_plane(state: Arc<HostState>, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/health/live", get(health_check))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(move || std::future::ready(metrics.render())))
        .merge(project_routes())
        .with_state(state)
}

/// Serves the control plane on `listener` until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    state: Arc<HostState>,
    metrics: PrometheusHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!("Control Plane listening on {}", listener.local_addr()?);
    axum::serve(listener, control_plane(state, metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

/// Runs the control plane HTTP server on the configured address.
///
/// # Errors
///
/// Returns an error if the server fails to start or encounters an error while running.
pub async fn run_server(
    state: Arc<HostState>,
    metrics: PrometheusHandle,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let server = &state.settings().server;
    let addr = BindAddress(server.host.clone(), server.port).to_socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, metrics, shutdown).await
}
