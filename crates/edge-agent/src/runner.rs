use std::{path::PathBuf, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::{
    config::{self, AgentMode},
    configurator::DynConfigurator,
    convergence::{DynRenderer, HaproxyConfigurator, HaproxyRenderer, TemplateRenderer},
    link::AgentLink,
    sink::StateLogger,
    supervisor::{HaproxyWorker, SignalProcessControl, Supervisor},
    telemetry, version,
};

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Initialize a tracing subscriber before starting the agent.
    pub init_tracing: bool,
    /// Start the dedicated `/metrics` HTTP server.
    pub serve_metrics: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_metrics: true,
        }
    }
}

/// Handle returned by [`start_agent`] to manage shutdown when embedded.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!(?join_err, "agent task panicked during shutdown");
                    anyhow::bail!("agent task panicked");
                }
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Builds the configurator selected by `cfg.mode`.
pub fn build_configurator(cfg: &config::AppConfig) -> anyhow::Result<DynConfigurator> {
    match cfg.mode {
        AgentMode::Log => Ok(Arc::new(StateLogger::stdout())),
        AgentMode::Haproxy => {
            let supervisor = Supervisor::new(
                PathBuf::from(&cfg.haproxy.config_path),
                cfg.pid_file()?,
                Arc::new(HaproxyWorker::new(
                    cfg.worker.binary.clone(),
                    cfg.worker.extra_args.clone(),
                )),
                Arc::new(SignalProcessControl),
                cfg.termination_grace(),
            );
            let renderer: DynRenderer = match &cfg.haproxy.template_path {
                Some(path) => Arc::new(TemplateRenderer::from_file(path)?),
                None => Arc::new(HaproxyRenderer::new(
                    cfg.haproxy.preamble_path.as_ref().map(PathBuf::from),
                    cfg.labels.mode_label.clone(),
                )),
            };
            Ok(Arc::new(HaproxyConfigurator::new(
                renderer,
                supervisor,
                cfg.haproxy.bind_address.clone(),
                cfg.labels.policy(),
            )))
        }
    }
}

/// Start the agent with the configurator selected by `cfg.mode`.
pub async fn start_agent(
    cfg: config::AppConfig,
    options: AgentOptions,
) -> anyhow::Result<AgentHandle> {
    let configurator = build_configurator(&cfg)?;
    start_agent_with(cfg, configurator, options).await
}

/// Start the agent around an already-built configurator.
pub async fn start_agent_with(
    cfg: config::AppConfig,
    configurator: DynConfigurator,
    options: AgentOptions,
) -> anyhow::Result<AgentHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }
    cfg.validate()?;

    let metrics_handle = telemetry::init_metrics_recorder();
    let metrics_addr = cfg.metrics_addr()?;

    info!(
        coordinators = ?cfg.coordinators,
        mode = ?cfg.mode,
        version = version::VERSION,
        git_sha = version::GIT_SHA,
        dirty = version::GIT_DIRTY,
        built_at = version::BUILD_TIMESTAMP,
        "relay agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics && cfg.serve_metrics {
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown_fut)
                    .await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let link = AgentLink::new(
        cfg.coordinators.clone(),
        cfg.connect_timeout(),
        cfg.reconnect_backoff_max(),
        configurator,
    );
    let link_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = link.run(link_shutdown).await {
            error!(?err, "coordinator link terminated with error");
        }
    }));

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
    })
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::base_config;
    use tokio::sync::watch;

    #[test]
    fn agent_options_defaults() {
        let opts = AgentOptions::default();
        assert!(opts.init_tracing);
        assert!(opts.serve_metrics);
    }

    #[tokio::test]
    async fn agent_handle_request_shutdown_sets_signal() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = AgentHandle {
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        };

        handle.request_shutdown();
        assert!(*handle.shutdown_signal().borrow());
    }

    #[tokio::test]
    async fn agent_handle_reports_task_panics() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async {
            panic!("boom");
        });
        let handle = AgentHandle {
            shutdown_tx,
            shutdown_rx,
            tasks: vec![task],
        };

        let err = handle.await_termination().await.expect_err("panic");
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn haproxy_mode_without_pid_file_is_rejected() {
        let mut cfg = base_config();
        cfg.mode = AgentMode::Haproxy;
        cfg.haproxy.pid_file = None;
        let err = build_configurator(&cfg).err().expect("missing pid file");
        assert!(err.to_string().contains("pid_file"), "{err}");
    }

    #[test]
    fn broken_template_is_rejected_at_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("haproxy.cfg.j2");
        std::fs::write(&template, "{% if %}").expect("write template");

        let mut cfg = base_config();
        cfg.haproxy.template_path = Some(template.display().to_string());
        let err = build_configurator(&cfg).err().expect("broken template");
        assert!(format!("{err:#}").contains("compile haproxy template"), "{err:#}");

        std::fs::write(&template, "bind {{ bind_address }}\n").expect("write template");
        assert!(build_configurator(&cfg).is_ok());
    }

    #[test]
    fn log_mode_builds_state_logger() {
        let mut cfg = base_config();
        cfg.mode = AgentMode::Log;
        assert!(build_configurator(&cfg).is_ok());
    }

    #[tokio::test]
    async fn started_agent_stops_on_request() {
        let mut cfg = base_config();
        cfg.mode = AgentMode::Log;
        cfg.coordinators = vec!["127.0.0.1:1".into()];
        cfg.reconnect_backoff_max_ms = 10;
        let handle = start_agent(
            cfg,
            AgentOptions {
                init_tracing: false,
                serve_metrics: false,
            },
        )
        .await
        .expect("start");

        tokio::time::timeout(std::time::Duration::from_secs(5), handle.shutdown())
            .await
            .expect("stops in time")
            .expect("clean shutdown");
    }
}
