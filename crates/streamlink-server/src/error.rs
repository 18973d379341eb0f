//! Error types for the hosting server.

use std::path::PathBuf;

use streamlink_bridge::{BridgeError, ConfigError, PlacementError};
use streamlink_consensus::ConsensusError;
use streamlink_repl::ReplError;
use thiserror::Error;

/// Errors surfaced by the server and its configuration loader.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The configuration file could not be parsed.
    #[error("failed to parse {path}: {msg}")]
    Parse {
        /// File being loaded.
        path: PathBuf,
        /// Parser message.
        msg: String,
    },

    /// The configuration file extension is neither toml nor json.
    #[error("unsupported config file extension: {0}")]
    UnsupportedFormat(String),

    /// Stream placement failed.
    #[error("placement failed: {0}")]
    Placement(#[from] PlacementError),

    /// Consensus operation failed.
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Bridge operation failed.
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Replication operation failed.
    #[error("replication error: {0}")]
    Replication(#[from] ReplError),

    /// Meta command could not be encoded or decoded.
    #[error("meta command encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_account() {
        let err = ServerError::from(ConfigError::RedirectedAccountEnabled {
            account: "ORDERS".into(),
        });
        assert!(err.to_string().contains("\"ORDERS\""));
    }
}
