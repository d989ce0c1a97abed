use anyhow::Context;
use clap::Parser;
use dbranch_kernel::branch_manager::BranchError;
use dbranch_kernel::cli::{self, Cli, Commands};
use dbranch_kernel::host::{run_daemon, HostState};
use dbranch_kernel::infrastructure::{audit, config::Settings, telemetry::TelemetryBuilder};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<BranchError>()
                .map_or(1, |b| cli::exit_code(b.kind()));
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _telemetry =
        TelemetryBuilder::from_settings(&config.telemetry, env!("CARGO_PKG_VERSION")).init()?;

    let state = Arc::new(HostState::connect(config).await?);

    if cli.command == Commands::Start {
        return serve(state).await;
    }

    let mut events = state.manager().events().subscribe();
    let result = cli::execute(&cli, state.manager()).await;
    audit::flush_audit(&mut events);
    let output = result?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

async fn serve(state: Arc<HostState>) -> anyhow::Result<()> {
    info!("dBranch starting...");
    audit::log_audit(&audit::AuditEvent::SystemStartup {
        component: "daemon".into(),
    });

    let (stop, stopped) = watch::channel(false);
    let daemon = tokio::spawn(run_daemon(Arc::clone(&state), stopped));

    shutdown_signal().await;
    info!("Shutdown signal received, cleaning up...");
    let _ = stop.send(true);

    let result = daemon.await.context("Daemon task panicked")?;
    if let Err(e) = &result {
        error!("Daemon failed: {:#}", e);
    }
    state.manager().store().close().await;

    audit::log_audit(&audit::AuditEvent::SystemShutdown {
        reason: "Signal received".into(),
    });
    info!("dBranch shutdown complete.");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
