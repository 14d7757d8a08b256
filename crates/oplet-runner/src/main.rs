//! Standalone runner binary.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oplet_runner::{Runner, RunnerConfig};
use oplet_task::DockerExecutor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RunnerConfig::from_env()?;
    let executor = Arc::new(DockerExecutor::new()?);
    let runner = Runner::new(config.clone(), executor)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    tracing::info!(server_url = %config.server_url, "starting runner");
    runner.run(shutdown).await?;
    Ok(())
}
