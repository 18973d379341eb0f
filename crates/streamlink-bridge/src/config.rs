//! Server configuration consumed by the bridge, placement and consensus layers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use streamlink_consensus::{PeerId, RaftConfig};

use crate::error::ConfigError;

/// Account used when a remote names none.
pub const GLOBAL_ACCOUNT: &str = "$G";

/// Default name of the system account.
pub const DEFAULT_SYSTEM_ACCOUNT: &str = "$SYS";

/// Whether a bridge may merge consensus membership with the remote deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionHint {
    /// Extend when both sides share a domain.
    #[default]
    Auto,
    /// Always join the remote's metadata group.
    #[serde(alias = "WILL_EXTEND", alias = "will-extend")]
    WillExtend,
    /// Never join; stay an isolated domain.
    #[serde(alias = "NO_EXTEND", alias = "no-extend")]
    NoExtend,
}

impl FromStr for ExtensionHint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "auto" => Ok(ExtensionHint::Auto),
            "will_extend" => Ok(ExtensionHint::WillExtend),
            "no_extend" => Ok(ExtensionHint::NoExtend),
            _ => Err(ConfigError::ExtensionHint(s.to_string())),
        }
    }
}

impl fmt::Display for ExtensionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionHint::Auto => write!(f, "auto"),
            ExtensionHint::WillExtend => write!(f, "will_extend"),
            ExtensionHint::NoExtend => write!(f, "no_extend"),
        }
    }
}

/// A configured account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account name
    pub name: String,
    /// Whether streams may be created locally for this account
    #[serde(default)]
    pub jetstream: bool,
}

/// One configured bridge remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Endpoints to dial, tried in order
    pub urls: Vec<String>,
    /// Local account the link is bound to
    #[serde(default = "default_remote_account")]
    pub account: String,
    /// Credentials file presented on connect
    #[serde(default)]
    pub credentials: Option<PathBuf>,
    /// Subjects the remote may not deliver to us
    #[serde(default)]
    pub deny_imports: Vec<String>,
    /// Subjects we may not deliver to the remote
    #[serde(default)]
    pub deny_exports: Vec<String>,
}

fn default_remote_account() -> String {
    GLOBAL_ACCOUNT.to_string()
}

impl RemoteConfig {
    /// A remote bound to `account` dialing `url`.
    pub fn new(url: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            account: account.into(),
            credentials: None,
            deny_imports: Vec::new(),
            deny_exports: Vec::new(),
        }
    }
}

/// Stream subsystem settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JetStreamConfig {
    /// Whether this server hosts streams
    pub enabled: bool,
    /// Domain this deployment belongs to
    pub domain: Option<String>,
    /// Extension behaviour for system-account remotes
    pub extension_hint: ExtensionHint,
    /// Delay before assets move off peers lost with a bridge
    pub migrate_delay_ms: Option<u64>,
    /// Demote every local stream and consumer group when a bridge is lost
    pub observer_on_remote_loss: bool,
    /// Directory for durable consensus and replication state
    pub store_dir: Option<PathBuf>,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            domain: None,
            extension_hint: ExtensionHint::Auto,
            migrate_delay_ms: None,
            observer_on_remote_loss: false,
            store_dir: None,
        }
    }
}

impl JetStreamConfig {
    /// Migrate delay, if migration is enabled.
    pub fn migrate_delay(&self) -> Option<Duration> {
        self.migrate_delay_ms.map(Duration::from_millis)
    }
}

/// Cluster identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Route listen address
    #[serde(default)]
    pub listen: Option<String>,
    /// Seed routes to other cluster members
    #[serde(default)]
    pub routes: Vec<String>,
}

/// Consensus timing shared by every group on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusTiming {
    /// Minimum election timeout in milliseconds
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

impl Default for ConsensusTiming {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl ConsensusTiming {
    /// Raft configuration for one group member.
    pub fn raft_config(&self, local_id: PeerId, peers: Vec<PeerId>) -> RaftConfig {
        RaftConfig {
            local_id,
            peers,
            election_timeout_min_ms: self.election_timeout_min_ms,
            election_timeout_max_ms: self.election_timeout_max_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }
    }

    /// Upper bound of the election timeout.
    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }
}

/// Everything a server needs to know about itself and its bridges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Display name; not required to be unique
    pub server_name: String,
    /// Fixed id; random when absent
    pub server_id: Option<u64>,
    /// Account carrying system and consensus traffic
    pub system_account: String,
    /// Configured accounts
    pub accounts: Vec<AccountConfig>,
    /// Stream subsystem
    pub jetstream: JetStreamConfig,
    /// Cluster identity
    pub cluster: Option<ClusterConfig>,
    /// Bridge remotes
    pub remotes: Vec<RemoteConfig>,
    /// Account name to domain redirect
    pub default_js_domain: BTreeMap<String, String>,
    /// Consensus timing
    pub consensus: ConsensusTiming,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "streamlink".to_string(),
            server_id: None,
            system_account: DEFAULT_SYSTEM_ACCOUNT.to_string(),
            accounts: Vec::new(),
            jetstream: JetStreamConfig::default(),
            cluster: None,
            remotes: Vec::new(),
            default_js_domain: BTreeMap::new(),
            consensus: ConsensusTiming::default(),
        }
    }
}

impl ServerConfig {
    /// Cluster name; a standalone server forms a cluster of its own name.
    pub fn cluster_name(&self) -> String {
        self.cluster
            .as_ref()
            .map(|c| c.name.clone())
            .unwrap_or_else(|| self.server_name.clone())
    }

    /// Configured domain, with empty text treated as unset.
    pub fn domain(&self) -> Option<String> {
        self.jetstream.domain.clone().filter(|d| !d.is_empty())
    }

    /// Whether the account can create streams locally.
    pub fn account_jetstream_enabled(&self, account: &str) -> bool {
        if !self.jetstream.enabled {
            return false;
        }
        if self.accounts.is_empty() {
            return account == GLOBAL_ACCOUNT;
        }
        self.accounts
            .iter()
            .any(|a| a.name == account && a.jetstream)
    }

    /// Whether the remote is bound to the system account.
    pub fn is_system_remote(&self, remote: &RemoteConfig) -> bool {
        remote.account == self.system_account
    }

    fn knows_account(&self, account: &str) -> bool {
        account == GLOBAL_ACCOUNT
            || account == self.system_account
            || self.accounts.iter().any(|a| a.name == account)
    }

    /// Structural validation. Any error here aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timing = &self.consensus;
        if timing.election_timeout_min_ms == 0
            || timing.election_timeout_max_ms < timing.election_timeout_min_ms
        {
            return Err(ConfigError::ElectionTimeout {
                min_ms: timing.election_timeout_min_ms,
                max_ms: timing.election_timeout_max_ms,
            });
        }
        if timing.heartbeat_interval_ms == 0
            || timing.heartbeat_interval_ms >= timing.election_timeout_min_ms
        {
            return Err(ConfigError::Heartbeat {
                heartbeat_ms: timing.heartbeat_interval_ms,
                min_ms: timing.election_timeout_min_ms,
            });
        }

        for (index, remote) in self.remotes.iter().enumerate() {
            if remote.urls.is_empty() {
                return Err(ConfigError::RemoteWithoutUrls { index });
            }
            if !self.knows_account(&remote.account) {
                return Err(ConfigError::UnknownRemoteAccount {
                    index,
                    account: remote.account.clone(),
                });
            }
        }

        // An empty domain redirects to the deployment without a domain and
        // is allowed next to a locally enabled account.
        for (account, domain) in &self.default_js_domain {
            if !domain.is_empty() && self.account_jetstream_enabled(account) {
                return Err(ConfigError::RedirectedAccountEnabled {
                    account: account.clone(),
                });
            }
        }
        Ok(())
    }

    /// Startup notices about how remotes authenticate and what they may exchange.
    pub fn remote_notices(&self) -> Vec<String> {
        let mut notices = Vec::new();
        for remote in &self.remotes {
            let system = self.is_system_remote(remote);
            if let Some(creds) = &remote.credentials {
                if system {
                    notices.push(format!(
                        "Bridge remote for system account uses credentials file {}",
                        creds.display()
                    ));
                } else {
                    notices.push(format!(
                        "Bridge remote for account {} uses credentials file {}",
                        remote.account,
                        creds.display()
                    ));
                }
            }
            if system && !remote.deny_exports.is_empty() {
                notices.push(format!(
                    "Remote for system account uses restricted export permissions: {:?}",
                    remote.deny_exports
                ));
            }
            if system && !remote.deny_imports.is_empty() {
                notices.push(format!(
                    "Remote for system account uses restricted import permissions: {:?}",
                    remote.deny_imports
                ));
            }
        }
        notices
    }

    /// Logs [`ServerConfig::remote_notices`].
    pub fn log_remote_notices(&self) {
        for notice in self.remote_notices() {
            tracing::info!(server = %self.server_name, "{}", notice);
        }
    }
}
