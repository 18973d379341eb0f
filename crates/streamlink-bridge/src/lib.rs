#![warn(missing_docs)]

//! streamlink bridge subsystem: configuration, bridge link lifecycle and stream placement

pub mod config;
pub mod error;
pub mod identity;
pub mod link;
pub mod remote;
pub mod router;

pub use config::{
    AccountConfig, ClusterConfig, ConsensusTiming, ExtensionHint, JetStreamConfig,
    RemoteConfig, ServerConfig, DEFAULT_SYSTEM_ACCOUNT, GLOBAL_ACCOUNT,
};
pub use error::{BridgeError, ConfigError, PlacementError};
pub use identity::{decide_extension, DeploymentIdentity, ExtensionDecision};
pub use link::{BridgeLinks, LinkContext, LinkEvent, TransportEvent};
pub use remote::{BridgeRemote, MigrationReport, RemoteState};
pub use router::{DomainRouter, Placement};
