//! Server configuration file loading.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use streamlink_bridge::ServerConfig;
use streamlink_repl::EngineConfig;

use crate::error::ServerError;

/// Complete configuration of one server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity, accounts, streaming, cluster, bridges and consensus timing.
    #[serde(flatten)]
    pub server: ServerConfig,
    /// Replication engine settings.
    #[serde(default)]
    pub replication: EngineConfig,
    /// Status publication period in milliseconds.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

fn default_status_interval_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            replication: EngineConfig::default(),
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

impl Config {
    /// Parse a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let parse_error = |msg: String| ServerError::Parse {
            path: path.to_path_buf(),
            msg,
        };
        match ext.as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string())),
            _ => Err(ServerError::UnsupportedFormat(ext)),
        }
    }

    /// Parse and validate a file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.server.validate()?;
        Ok(())
    }

    /// Status publication period.
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(10))
    }
}
