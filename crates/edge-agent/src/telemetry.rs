use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use metrics::{counter, histogram};
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

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// `result` is one of `applied`, `unchanged` or `error`.
pub fn record_update(result: &str) {
    counter!(
        "relay_agent_update_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_update_duration(result: &str, duration: Duration) {
    histogram!(
        "relay_agent_update_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_connect(result: &str) {
    counter!(
        "relay_agent_connect_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_worker_action(action: &str, result: &str) {
    counter!(
        "relay_agent_worker_action_total",
        "action" => action.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_termination(result: &str) {
    counter!(
        "relay_agent_termination_total",
        "result" => result.to_string()
    )
    .increment(1);
}
