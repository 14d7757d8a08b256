//! Environment-based coordinator configuration.

use std::path::PathBuf;

/// Coordinator knobs, read from `OPLET_*` environment variables with
/// working defaults for a local setup.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:3000`.
    pub http_address: String,
    pub database_path: PathBuf,
    /// Base directory of the blob store.
    pub data_dir: PathBuf,
    /// Spawn the in-process embedded runner.
    pub embedded_runner: bool,
    /// Delete executions older than this many days; `None` disables the
    /// janitor.
    pub retention_days: Option<u32>,
    /// URL the embedded runner contacts; defaults to the listen address.
    pub server_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_address: "127.0.0.1:3000".to_string(),
            database_path: PathBuf::from("data/store.sqlite"),
            data_dir: PathBuf::from("data/files"),
            embedded_runner: true,
            retention_days: None,
            server_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(address) = std::env::var("OPLET_HTTP_ADDRESS") {
            config.http_address = address;
        }
        if let Ok(path) = std::env::var("OPLET_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("OPLET_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(flag) = std::env::var("OPLET_EMBEDDED_RUNNER") {
            config.embedded_runner = flag != "false" && flag != "0";
        }
        if let Ok(days) = std::env::var("OPLET_RETENTION_DAYS") {
            config.retention_days = Some(days.parse()?);
        }
        if let Ok(url) = std::env::var("OPLET_SERVER_URL") {
            config.server_url = Some(url);
        }

        Ok(config)
    }

    /// URL the embedded runner uses to reach this coordinator.
    pub fn effective_server_url(&self) -> String {
        self.server_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.http_address))
    }
}
