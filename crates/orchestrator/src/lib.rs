//! Single-node deployment orchestrator: accepts application sources, builds
//! container images for them and runs each deployment on its own host port.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

pub mod allocator;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod http;
pub mod persistence;
pub mod pipeline;
pub mod runtime;
pub mod source;
pub mod state;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;

pub use telemetry::init_tracing;

/// Boot the orchestrator: store, runtime, pipeline worker, metrics exporter
/// and API server. Runs until Ctrl+C or SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let cfg = config::load()?;
    info!(
        http_port = cfg.http_port,
        port_range_start = cfg.port_range_start,
        port_range_end = cfg.port_range_end,
        "orchestrator starting"
    );

    tokio::fs::create_dir_all(&cfg.upload_dir).await?;
    tokio::fs::create_dir_all(&cfg.workspace_dir).await?;

    let metrics_handle = telemetry::init_metrics_recorder();
    let metrics_addr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port).parse()?;

    let db = persistence::init_store(&cfg.store_url).await?;
    let runtime: runtime::DynContainerRuntime = Arc::new(runtime::DockerRuntime::connect()?);

    let (state, queue_rx) = state::Orchestrator::new(cfg, db, runtime);
    state.reconcile().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(pipeline::worker_loop(
        Arc::clone(&state),
        queue_rx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(async move {
        if let Err(err) = telemetry::serve_metrics(metrics_handle, metrics_addr).await {
            error!(error = %err, "metrics server failed");
        }
    });
    let api = tokio::spawn(http::serve(Arc::clone(&state), shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send(true)?;

    worker.await?;
    api.await??;

    if state.cfg().cleanup_on_shutdown {
        info!("removing managed containers before exit");
        state.cleanup_managed_containers().await;
    }
    info!("orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
