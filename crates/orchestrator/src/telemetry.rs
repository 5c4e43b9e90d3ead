use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn record_api_request(method: &str, endpoint: &'static str) {
    counter!(
        "slipway_api_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint
    )
    .increment(1);
}

pub fn record_deployment_finished(result: &str) {
    counter!(
        "slipway_deployments_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_pipeline_step(step: &'static str, result: &str, duration: Duration) {
    counter!(
        "slipway_pipeline_steps_total",
        "step" => step,
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        "slipway_pipeline_step_duration_ms",
        "step" => step
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("slipway_queue_depth").set(depth as f64);
}

pub fn record_ports_in_use(count: usize) {
    gauge!("slipway_ports_in_use").set(count as f64);
}
