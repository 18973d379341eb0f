//! Periodic server status for the monitoring collaborator.

use std::collections::BTreeMap;

use serde::Serialize;
use streamlink_bridge::{BridgeRemote, ExtensionDecision};
use streamlink_consensus::{GroupStatus, NameCollision, PeerId, PeerInfo};
use streamlink_repl::{FeedHealthReport, ReplicationHealth};

/// One configured bridge remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStatus {
    /// Configuration index
    pub index: usize,
    /// Local account the link is bound to
    pub account: String,
    /// Connection state
    pub state: String,
    /// Extension decision of the current or last connection
    pub decision: Option<ExtensionDecision>,
    /// Far-side server
    pub remote: Option<PeerId>,
    /// Far-side domain
    pub remote_domain: Option<String>,
    /// Whether a migrate timer is armed
    pub migration_pending: bool,
}

impl RemoteStatus {
    /// Snapshot one remote.
    pub fn from_remote(remote: &BridgeRemote) -> Self {
        let identity = remote.identity();
        Self {
            index: remote.index(),
            account: remote.config().account.clone(),
            state: remote.state().to_string(),
            decision: remote.decision(),
            remote: identity.as_ref().map(|i| i.id),
            remote_domain: identity.and_then(|i| i.domain),
            migration_pending: remote.migration_pending(),
        }
    }
}

/// Everything one server reports about itself.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Server id
    pub server_id: PeerId,
    /// Display name
    pub server_name: String,
    /// Domain, if any
    pub domain: Option<String>,
    /// Cluster name
    pub cluster: String,
    /// Leader of the metadata group as seen here
    pub meta_leader: Option<PeerId>,
    /// Hosted consensus groups
    pub groups: Vec<GroupStatus>,
    /// Known peers keyed by id
    pub peers: BTreeMap<PeerId, PeerInfo>,
    /// Display names reported by more than one id
    pub name_collisions: Vec<NameCollision>,
    /// Configured bridges
    pub remotes: Vec<RemoteStatus>,
    /// Overall replication health
    pub replication: ReplicationHealth,
    /// Per-feed replication diagnostics
    pub feeds: Vec<FeedHealthReport>,
    /// Streams stored on this server
    pub streams: Vec<String>,
}

impl ServerStatus {
    /// Groups without a known leader.
    pub fn stalled_groups(&self) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.is_stalled())
            .map(|g| g.name.as_str())
            .collect()
    }

    /// Groups where the local member is an observer.
    pub fn observer_groups(&self) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.observer)
            .map(|g| g.name.as_str())
            .collect()
    }

    /// JSON rendering for the system account.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlink_bridge::RemoteConfig;
    use streamlink_consensus::{GroupKind, RaftState};

    fn group(name: &str, leader: Option<u64>, observer: bool) -> GroupStatus {
        GroupStatus {
            name: name.into(),
            kind: GroupKind::Stream,
            term: 3,
            role: RaftState::Follower,
            leader: leader.map(PeerId::new),
            observer,
            link_lost: observer,
            members: vec![PeerId::new(1), PeerId::new(2)],
            commit_index: 7,
        }
    }

    fn status() -> ServerStatus {
        let mut peers = BTreeMap::new();
        peers.insert(PeerId::new(1), PeerInfo::new(PeerId::new(1), "A", "hub"));
        peers.insert(PeerId::new(2), PeerInfo::new(PeerId::new(2), "A", "hub"));
        ServerStatus {
            server_id: PeerId::new(1),
            server_name: "A".into(),
            domain: None,
            cluster: "hub".into(),
            meta_leader: Some(PeerId::new(2)),
            groups: vec![group("ORDERS", Some(2), false), group("EVENTS", None, true)],
            peers,
            name_collisions: vec![NameCollision {
                name: "A".into(),
                ids: vec![PeerId::new(1), PeerId::new(2)],
            }],
            remotes: Vec::new(),
            replication: ReplicationHealth::NotConfigured,
            feeds: Vec::new(),
            streams: vec!["ORDERS".into()],
        }
    }

    #[test]
    fn test_group_rollups() {
        let status = status();
        assert_eq!(status.stalled_groups(), vec!["EVENTS"]);
        assert_eq!(status.observer_groups(), vec!["EVENTS"]);
    }

    #[test]
    fn test_json_keys_peers_by_id() {
        let json: serde_json::Value = serde_json::from_str(&status().to_json().unwrap()).unwrap();
        let peers = json["peers"].as_object().unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains_key("1"));
        assert!(peers.contains_key("2"));
        assert_eq!(json["name_collisions"][0]["name"], "A");
        assert_eq!(json["replication"], "not_configured");
    }

    #[test]
    fn test_remote_status_before_connect() {
        let remote = BridgeRemote::new(0, RemoteConfig::new("nats://hub:7422", "$SYS"), true);
        let status = RemoteStatus::from_remote(&remote);
        assert_eq!(status.index, 0);
        assert_eq!(status.account, "$SYS");
        assert_eq!(status.state, "connecting");
        assert_eq!(status.decision, None);
        assert_eq!(status.remote, None);
        assert!(!status.migration_pending);
    }
}
