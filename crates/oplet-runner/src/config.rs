//! Environment-based runner configuration.

use std::time::Duration;

/// Knobs of the runner loop. Read from `OPLET_*` environment variables by
/// the binary; constructed directly by the embedded runner and tests.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub server_url: String,
    pub token: String,
    /// Cadence of the lease poll.
    pub execution_interval: Duration,
    /// Cadence of the keep-alive heartbeat.
    pub heartbeat_interval: Duration,
}

impl RunnerConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            execution_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let server_url = std::env::var("OPLET_SERVER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
        let token = std::env::var("OPLET_RUNNER_TOKEN")
            .map_err(|_| anyhow::anyhow!("OPLET_RUNNER_TOKEN is required"))?;

        let mut config = Self::new(server_url, token);
        if let Ok(seconds) = std::env::var("OPLET_EXECUTION_INTERVAL_SECS") {
            config.execution_interval = Duration::from_secs(seconds.parse()?);
        }
        Ok(config)
    }
}
