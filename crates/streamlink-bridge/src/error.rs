//! Error types for configuration, placement and bridge link handling.

use streamlink_consensus::ConsensusError;
use thiserror::Error;

/// Structurally invalid configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An account is both enabled locally and redirected to another domain.
    #[error("default_js_domain contains account name \"{account}\" with enabled JetStream")]
    RedirectedAccountEnabled {
        /// Offending account
        account: String,
    },

    /// A remote names an account that is not configured.
    #[error("remote {index} references unknown account \"{account}\"")]
    UnknownRemoteAccount {
        /// Position of the remote in the configuration
        index: usize,
        /// Account name
        account: String,
    },

    /// A remote has nothing to dial.
    #[error("remote {index} has no urls")]
    RemoteWithoutUrls {
        /// Position of the remote in the configuration
        index: usize,
    },

    /// Election timeout bounds are inverted or zero.
    #[error("invalid election timeout: min {min_ms}ms, max {max_ms}ms")]
    ElectionTimeout {
        /// Lower bound in milliseconds
        min_ms: u64,
        /// Upper bound in milliseconds
        max_ms: u64,
    },

    /// Heartbeats must be well inside the election timeout.
    #[error("heartbeat interval {heartbeat_ms}ms must be below election timeout min {min_ms}ms")]
    Heartbeat {
        /// Heartbeat in milliseconds
        heartbeat_ms: u64,
        /// Election timeout lower bound in milliseconds
        min_ms: u64,
    },

    /// Unrecognized extension hint text.
    #[error("unknown extension hint: {0}")]
    ExtensionHint(String),
}

/// A stream placement request that cannot be satisfied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// The target cluster lacks enough eligible peers.
    #[error("no suitable peers for placement for cluster {cluster}: {available} available, {required} required")]
    NoSuitablePeers {
        /// Target cluster
        cluster: String,
        /// Eligible peers found
        available: usize,
        /// Replicas requested
        required: usize,
    },

    /// The account has no local stream support and no redirect.
    #[error("JetStream not enabled for account {account}")]
    JetStreamNotEnabled {
        /// Account name
        account: String,
    },

    /// The redirect names a domain with no known stream-capable cluster.
    #[error("no cluster known for domain {domain:?}")]
    UnknownDomain {
        /// Domain name, empty for the default domain
        domain: String,
    },

    /// Replica count must be at least one.
    #[error("invalid replica count: {0}")]
    InvalidReplicas(usize),

    /// Placement needs a metadata leader to record the assignment.
    #[error("JetStream system temporarily unavailable: no metadata leader")]
    NoMetaLeader,
}

/// Failures while handling bridge link events.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No remote at this position.
    #[error("unknown remote index {0}")]
    UnknownRemote(usize),

    /// The remote was shut down and accepts no events.
    #[error("remote {0} is shut down")]
    RemoteShutdown(usize),

    /// A consensus operation failed.
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}
