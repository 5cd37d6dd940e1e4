mod daemon;
mod direct_transfer;
mod manager;
mod options;
mod sync;
mod updater;

use tracing_subscriber::EnvFilter;

use crate::daemon::{DaemonConfig, DaemonRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::from_env()?;
    let runtime = DaemonRuntime::bootstrap(config).await?;
    runtime.run().await
}
