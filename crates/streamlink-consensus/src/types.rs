//! Identifiers and wire types shared by every consensus group.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the privileged cluster-metadata group.
pub const META_GROUP: &str = "_meta_";

/// Unique identifier of a server participating in consensus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    /// Wrap a raw server id.
    pub fn new(id: u64) -> Self {
        PeerId(id)
    }

    /// Raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Election epoch; at most one leader per term.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    /// Wrap a raw term.
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    /// Raw term.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The term a new campaign runs in.
    pub fn next(self) -> Self {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-based position in a group's log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    /// Index preceding the first entry
    pub const ZERO: LogIndex = LogIndex(0);

    /// Wrap a raw index.
    pub fn new(index: u64) -> Self {
        LogIndex(index)
    }

    /// Raw index.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of asset a group replicates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    /// Cluster-wide placement and assignment state.
    Meta,
    /// A replicated stream.
    Stream,
    /// A replicated consumer.
    Consumer,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKind::Meta => write!(f, "meta"),
            GroupKind::Stream => write!(f, "stream"),
            GroupKind::Consumer => write!(f, "consumer"),
        }
    }
}

/// An operation carried in a group's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOp {
    /// Full membership record, written by a new leader when the log has none.
    SetMembers {
        /// Every voting member, including the writer.
        members: Vec<PeerId>,
    },
    /// Adds a voting member.
    AddPeer {
        /// Peer being added
        peer: PeerId,
    },
    /// Removes a voting member.
    RemovePeer {
        /// Peer being removed
        peer: PeerId,
    },
    /// Written by a new leader to commit entries from earlier terms.
    Noop,
    /// Opaque state machine command.
    Payload(Vec<u8>),
}

impl GroupOp {
    /// Returns true if applying this entry changes the peer set.
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            GroupOp::SetMembers { .. } | GroupOp::AddPeer { .. } | GroupOp::RemovePeer { .. }
        )
    }
}

/// A single entry in a group's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log
    pub index: LogIndex,
    /// Term in which the entry was created
    pub term: Term,
    /// Operation carried by the entry
    pub op: GroupOp,
}

/// Messages exchanged between members of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// A candidate asking for a vote
    RequestVote {
        /// Term of the campaign
        term: Term,
        /// Campaigning member
        candidate_id: PeerId,
        /// Newest index in the candidate's log
        last_log_index: LogIndex,
        /// Term of that entry
        last_log_term: Term,
    },
    /// Vote reply
    RequestVoteResponse {
        /// Voter's term
        term: Term,
        /// Granted or refused
        vote_granted: bool,
    },
    /// Replication batch; empty batches are heartbeats
    AppendEntries {
        /// Sender's term
        term: Term,
        /// Sending leader
        leader_id: PeerId,
        /// Entry the batch follows
        prev_log_index: LogIndex,
        /// Term the follower must hold at `prev_log_index`
        prev_log_term: Term,
        /// Batch, possibly empty
        entries: Vec<LogEntry>,
        /// Sender's commit index
        leader_commit: LogIndex,
    },
    /// Reply to a replication batch
    AppendEntriesResponse {
        /// Follower's term
        term: Term,
        /// Whether the batch was accepted
        success: bool,
        /// Last index known to match the leader
        match_index: LogIndex,
    },
    /// A follower handing a proposal to the leader it knows about.
    ForwardProposal {
        /// Operation to propose
        op: GroupOp,
    },
}

/// Role of a member within its group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftState {
    /// Accepts entries from the leader
    Follower,
    /// Campaigning for votes
    Candidate,
    /// Accepts proposals and replicates them
    Leader,
}

impl fmt::Display for RaftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftState::Follower => write!(f, "follower"),
            RaftState::Candidate => write!(f, "candidate"),
            RaftState::Leader => write!(f, "leader"),
        }
    }
}

/// State that must survive a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term seen
    pub term: Term,
    /// Candidate voted for in `term`
    pub voted_for: Option<PeerId>,
    /// Highest index known committed
    pub commit: LogIndex,
}

impl Default for HardState {
    fn default() -> Self {
        Self {
            term: Term::new(0),
            voted_for: None,
            commit: LogIndex::ZERO,
        }
    }
}

/// Errors produced by consensus groups and their storage.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// This member is not the leader
    #[error("not the leader for group; leader hint: {leader_hint:?}")]
    NotLeader {
        /// Leader this member last heard from
        leader_hint: Option<PeerId>,
    },

    /// The group currently has no leader
    #[error("group {group} has no leader")]
    NoLeader {
        /// Group name
        group: String,
    },

    /// Observers may not lead or propose
    #[error("group {group} is an observer on this server")]
    Observer {
        /// Group name
        group: String,
    },

    /// The metadata group never enters observer mode
    #[error("the metadata group cannot become an observer")]
    MetaObserver,

    /// No group with this name is hosted here
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// A group with this name is already hosted here
    #[error("group already exists: {0}")]
    GroupExists(String),

    /// Durable log failure
    #[error("log storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for ConsensusError {
    fn from(err: bincode::Error) -> Self {
        ConsensusError::Storage(err.to_string())
    }
}
