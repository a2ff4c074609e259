use edge_agent::{
    config,
    runner::{self, AgentOptions},
    telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = config::load()?;

    let handle = runner::start_agent(
        cfg,
        AgentOptions {
            init_tracing: false,
            ..AgentOptions::default()
        },
    )
    .await?;

    runner::wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping agent");
    handle.shutdown().await
}
