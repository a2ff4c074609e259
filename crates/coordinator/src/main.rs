#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coordinator::init_tracing();
    let cfg = coordinator::config::load()?;
    coordinator::run(cfg).await
}
