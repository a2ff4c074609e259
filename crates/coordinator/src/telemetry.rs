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

pub fn record_poll(result: &str) {
    counter!(
        "relay_coordinator_poll_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_subscribers(count: usize) {
    gauge!("relay_coordinator_subscribers").set(count as f64);
}

pub fn record_subscriber_removed(reason: &str) {
    counter!(
        "relay_coordinator_subscriber_removed_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_fanout(result: &str) {
    counter!(
        "relay_coordinator_fanout_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_fanout_duration(duration: Duration) {
    histogram!("relay_coordinator_fanout_duration_ms").record(duration.as_secs_f64() * 1000.0);
}

pub fn record_delivery(result: &str) {
    counter!(
        "relay_coordinator_delivery_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_source_request(endpoint: &str, result: &str) {
    counter!(
        "relay_coordinator_source_requests_total",
        "endpoint" => endpoint.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}
