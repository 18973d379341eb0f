#![warn(missing_docs)]

//! streamlink consensus subsystem: per-asset Raft groups, observer mode, peer registry

pub mod consensus;
pub mod driver;
pub mod group;
pub mod log_store;
pub mod network;
pub mod peers;
pub mod registry;
pub mod types;

pub use consensus::{LogChanges, RaftConfig, RaftNode};
pub use driver::{Committed, GroupDriver};
pub use group::{ConsensusGroup, GroupStatus, GroupTiming};
pub use log_store::{FileLogStore, LogStore, MemLogStore};
pub use network::{Envelope, LocalNetwork, RaftTransport};
pub use peers::{NameCollision, PeerEvent, PeerInfo, PeerRegistry};
pub use registry::GroupRegistry;
pub use types::{
    ConsensusError, GroupKind, GroupOp, HardState, LogEntry, LogIndex, PeerId, RaftMessage,
    RaftState, Term, META_GROUP,
};
