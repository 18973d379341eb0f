//! Cluster metadata: stream assignments replicated through the meta group.
//!
//! Commands travel as JSON payloads in the meta group's log. Every server applies the
//! committed commands in log order to its own [`MetaState`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use streamlink_consensus::{GroupOp, LogEntry, PeerId};
use streamlink_repl::StreamConfig;

/// A stream and the servers hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAssignment {
    /// Owning account
    pub account: String,
    /// Cluster the replicas live in
    pub cluster: String,
    /// Domain of that cluster
    pub domain: Option<String>,
    /// Replica servers; the first one hosts the stream data
    pub peers: Vec<PeerId>,
    /// Stream definition
    pub config: StreamConfig,
}

impl StreamAssignment {
    /// Stream name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Consensus group replicating the stream.
    pub fn group_name(&self) -> String {
        format!("S:{}", self.config.name)
    }

    /// Server hosting the stream data.
    pub fn host(&self) -> Option<PeerId> {
        self.peers.first().copied()
    }
}

/// Commands carried by the meta group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetaCommand {
    /// Create a stream on the listed peers.
    AssignStream(StreamAssignment),
    /// Remove a stream everywhere.
    RemoveStream {
        /// Stream name
        name: String,
    },
}

impl MetaCommand {
    /// Encode as a meta group payload.
    pub fn encode(&self) -> Result<GroupOp, serde_json::Error> {
        Ok(GroupOp::Payload(serde_json::to_vec(self)?))
    }

    /// Decode a payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// What applying one entry changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaChange {
    /// A stream was assigned.
    Assigned(StreamAssignment),
    /// A stream was removed.
    Removed(StreamAssignment),
}

/// Applied metadata.
#[derive(Debug, Default)]
pub struct MetaState {
    streams: BTreeMap<String, StreamAssignment>,
    applied_index: u64,
}

impl MetaState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed entry. Entries that are not payloads and payloads that do
    /// not decode change nothing. A log replaced by a join restarts its indexes, so
    /// duplicates are caught by stream name rather than by index.
    pub fn apply(&mut self, entry: &LogEntry) -> Option<MetaChange> {
        let index = entry.index.as_u64();
        self.applied_index = index;
        let GroupOp::Payload(payload) = &entry.op else {
            return None;
        };
        let command = match MetaCommand::decode(payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping undecodable meta entry");
                return None;
            }
        };
        match command {
            MetaCommand::AssignStream(assignment) => {
                if self.streams.contains_key(assignment.name()) {
                    tracing::debug!(stream = %assignment.name(), "stream already assigned");
                    return None;
                }
                self.streams
                    .insert(assignment.name().to_string(), assignment.clone());
                Some(MetaChange::Assigned(assignment))
            }
            MetaCommand::RemoveStream { name } => {
                self.streams.remove(&name).map(MetaChange::Removed)
            }
        }
    }

    /// Assignment of one stream.
    pub fn stream(&self, name: &str) -> Option<&StreamAssignment> {
        self.streams.get(name)
    }

    /// Every assignment, by stream name.
    pub fn streams(&self) -> impl Iterator<Item = &StreamAssignment> {
        self.streams.values()
    }

    /// Assignments that include `peer`.
    pub fn assigned_to(&self, peer: PeerId) -> Vec<StreamAssignment> {
        self.streams
            .values()
            .filter(|a| a.peers.contains(&peer))
            .cloned()
            .collect()
    }

    /// Index of the last applied entry.
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }
}
