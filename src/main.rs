use anyhow::Context;
use offline_pos_core::{logging, CoreConfig, PosCore};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = CoreConfig::load().context("failed to load configuration")?;
    let _log_guard = logging::init(&config);

    info!(
        "Starting offline POS core v{} ({} built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA"),
        env!("BUILD_TIMESTAMP")
    );

    let core = PosCore::open(config).context("failed to open the local store")?;
    core.start_background();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    core.shutdown().await?;
    Ok(())
}
