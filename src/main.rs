use time_warden::node::run_supervised;
use time_warden::utils::config::Config;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load().map_err(|err| anyhow::anyhow!("{err}"))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let supervisor = tokio::spawn(run_supervised(config, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("[NODE] Interrupt received, shutting down...");
    let _ = shutdown_tx.send(());

    match supervisor.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("supervisor task failed: {err}")),
    }
}
