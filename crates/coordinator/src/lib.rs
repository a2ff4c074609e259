pub mod config;
pub mod coordinator;
pub mod registry;
pub mod session;
pub mod source;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;

pub use common::version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::{
    coordinator::{poll_loop, Coordinator, SharedCoordinator},
    registry::SubscriberRegistry,
    session::accept_connections,
    source::{DynSnapshotSource, MarathonSource},
};

/// Builds the coordinator for `cfg` with the Marathon source.
pub fn build_coordinator(cfg: &config::AppConfig) -> Result<SharedCoordinator> {
    let source: DynSnapshotSource = Arc::new(MarathonSource::new(
        cfg.source.endpoints.clone(),
        Duration::from_secs(cfg.source.request_timeout_secs),
    )?);
    Ok(Arc::new(Coordinator::new(
        source,
        SubscriberRegistry::new(),
        cfg.fanout_deadline(),
        cfg.delivery_timeout(),
    )))
}

pub async fn run(cfg: config::AppConfig) -> Result<()> {
    run_with_shutdown(cfg, shutdown_signal()).await
}

/// Runs the poll loop, the agent listener and the metrics endpoint until
/// `shutdown` resolves or one of them fails.
pub async fn run_with_shutdown<S>(cfg: config::AppConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = telemetry::init_metrics_recorder();
    let listen_addr = cfg.listen_addr()?;
    let metrics_addr = cfg.metrics_addr()?;
    let coordinator = build_coordinator(&cfg)?;

    info!(
        %listen_addr,
        endpoints = ?cfg.source.endpoints,
        poll_interval_ms = cfg.poll_interval_ms,
        fanout_deadline_ms = cfg.fanout_deadline_ms,
        version = version::VERSION,
        git_sha = version::GIT_SHA,
        dirty = version::GIT_DIRTY,
        built_at = version::BUILD_TIMESTAMP,
        "coordinator starting"
    );

    let listener = TcpListener::bind(listen_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut metrics_shutdown = shutdown_rx.clone();
    let mut metrics_task = tokio::spawn(async move {
        telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, async move {
            let _ = metrics_shutdown.changed().await;
        })
        .await
    });

    let mut accept_task: JoinHandle<Result<()>> = tokio::spawn(accept_connections(
        listener,
        coordinator.clone(),
        shutdown_rx.clone(),
    ));
    let mut poll_task: JoinHandle<Result<()>> = tokio::spawn(poll_loop(
        coordinator.clone(),
        cfg.poll_interval(),
        shutdown_rx.clone(),
    ));

    tokio::select! {
        res = &mut accept_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("agent listener task failed: {err}"))??;
        }
        res = &mut poll_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("poll task failed: {err}"))??;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))??;
        }
    }

    for (name, task) in [
        ("agent listener", accept_task),
        ("poll", poll_task),
        ("metrics", metrics_task),
    ] {
        if !task.is_finished() {
            if let Err(err) = task.await {
                error!(task = name, ?err, "task failed during shutdown");
            }
        }
    }

    info!("coordinator stopped");
    Ok(())
}

pub fn init_tracing() {
    telemetry::init_tracing();
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
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
