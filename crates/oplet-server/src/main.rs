//! Coordinator binary: store, blob storage, runner protocol and the
//! embedded runner, wired together from environment configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oplet_files::FileStorage;
use oplet_runner::{Runner as WorkerLoop, RunnerConfig};
use oplet_server::{janitor, router, AppState, ServerConfig};
use oplet_store::{RunnerRepository, Store};
use oplet_task::{DockerExecutor, OciProvider};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("could not create {}", parent.display()))?;
    }
    let store = Store::open(&config.database_path)
        .with_context(|| format!("could not open {}", config.database_path.display()))?;
    let files = FileStorage::new(&config.data_dir);
    let state = AppState::new(store.clone(), files, Arc::new(OciProvider::new()));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    if let Some(retention_days) = config.retention_days {
        janitor::spawn(state.clone(), retention_days, shutdown.clone());
    }

    if config.embedded_runner {
        spawn_embedded_runner(&store, &config, shutdown.clone());
    }

    let listener = tokio::net::TcpListener::bind(&config.http_address)
        .await
        .with_context(|| format!("could not bind {}", config.http_address))?;
    tracing::info!(address = %config.http_address, "oplet coordinator listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Starts the in-process worker against this coordinator's own URL, using
/// the persisted embedded-runner token.
fn spawn_embedded_runner(store: &Store, config: &ServerConfig, shutdown: CancellationToken) {
    let embedded = match RunnerRepository::new(store.clone()).ensure_embedded() {
        Ok(runner) => runner,
        Err(err) => {
            tracing::error!(error = %err, "could not provision embedded runner");
            return;
        }
    };

    let executor = match DockerExecutor::new() {
        Ok(executor) => Arc::new(executor),
        Err(err) => {
            tracing::warn!(
                error = %err,
                "docker unavailable, embedded runner disabled"
            );
            return;
        }
    };

    let runner_config = RunnerConfig::new(config.effective_server_url(), embedded.token);
    let worker = match WorkerLoop::new(runner_config, executor) {
        Ok(worker) => worker,
        Err(err) => {
            tracing::error!(error = %err, "could not create embedded runner");
            return;
        }
    };

    tokio::spawn(async move {
        tracing::info!("starting embedded runner");
        if let Err(err) = worker.run(shutdown).await {
            tracing::error!(error = %err, "embedded runner failed");
        }
    });
}
