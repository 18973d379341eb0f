//! Identity exchanged when a bridge connects and the extension decision made from it.

use serde::{Deserialize, Serialize};
use streamlink_consensus::{PeerId, PeerInfo};

use crate::config::ExtensionHint;

/// What each side of a bridge tells the other on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentIdentity {
    /// Display name of the connecting server
    pub server_name: String,
    /// Unique id of the connecting server
    pub id: PeerId,
    /// Domain, if one is configured
    pub domain: Option<String>,
    /// Cluster name
    pub cluster: String,
    /// Whether the server hosts streams
    pub jetstream: bool,
    /// Servers of the sender's cluster, the sender included
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

impl DeploymentIdentity {
    /// The sender as a registry entry.
    pub fn as_peer(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.server_name.clone(),
            domain: self.domain.clone(),
            cluster: self.cluster.clone(),
            reachable: true,
            observer: false,
            jetstream: self.jetstream,
        }
    }

    /// Every server reachable through this link, sender first, without duplicates.
    pub fn reachable_peers(&self) -> Vec<PeerInfo> {
        let mut peers = vec![self.as_peer()];
        for peer in &self.peers {
            if peer.id != self.id {
                let mut peer = peer.clone();
                peer.reachable = true;
                peers.push(peer);
            }
        }
        peers
    }

    /// Ids of every server reachable through this link.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.reachable_peers().iter().map(|p| p.id).collect()
    }
}

/// Outcome of [`decide_extension`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionDecision {
    /// Merge consensus membership with the remote deployment.
    Extend,
    /// Carry only application traffic and replication feeds.
    Isolate,
}

/// Decide whether a link merges consensus membership.
///
/// Only system-account links may carry consensus traffic. After that the hint decides;
/// `auto` extends when both sides agree on the domain, including both having none.
pub fn decide_extension(
    hint: ExtensionHint,
    system_link: bool,
    local_domain: Option<&str>,
    remote_domain: Option<&str>,
) -> ExtensionDecision {
    if !system_link {
        return ExtensionDecision::Isolate;
    }
    match hint {
        ExtensionHint::NoExtend => ExtensionDecision::Isolate,
        ExtensionHint::WillExtend => ExtensionDecision::Extend,
        ExtensionHint::Auto => {
            fn norm(d: Option<&str>) -> Option<&str> {
                d.filter(|d| !d.is_empty())
            }
            if norm(local_domain) == norm(remote_domain) {
                ExtensionDecision::Extend
            } else {
                ExtensionDecision::Isolate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_links_never_extend() {
        for hint in [ExtensionHint::Auto, ExtensionHint::WillExtend, ExtensionHint::NoExtend] {
            assert_eq!(
                decide_extension(hint, false, None, None),
                ExtensionDecision::Isolate
            );
        }
    }

    #[test]
    fn test_hint_overrides_domains() {
        assert_eq!(
            decide_extension(ExtensionHint::WillExtend, true, Some("hub"), Some("leaf")),
            ExtensionDecision::Extend
        );
        assert_eq!(
            decide_extension(ExtensionHint::NoExtend, true, Some("hub"), Some("hub")),
            ExtensionDecision::Isolate
        );
    }

    #[test]
    fn test_auto_compares_domains() {
        let auto = ExtensionHint::Auto;
        assert_eq!(decide_extension(auto, true, None, None), ExtensionDecision::Extend);
        assert_eq!(decide_extension(auto, true, Some(""), None), ExtensionDecision::Extend);
        assert_eq!(
            decide_extension(auto, true, Some("hub"), Some("hub")),
            ExtensionDecision::Extend
        );
        assert_eq!(
            decide_extension(auto, true, Some("hub"), Some("leaf")),
            ExtensionDecision::Isolate
        );
        assert_eq!(decide_extension(auto, true, Some("hub"), None), ExtensionDecision::Isolate);
    }

    #[test]
    fn test_reachable_peers_deduplicates_sender() {
        let identity = DeploymentIdentity {
            server_name: "HUB-1".into(),
            id: PeerId::new(1),
            domain: Some("hub".into()),
            cluster: "HUB".into(),
            jetstream: true,
            peers: vec![
                PeerInfo::new(PeerId::new(1), "HUB-1", "HUB"),
                PeerInfo::new(PeerId::new(2), "HUB-2", "HUB"),
            ],
        };
        assert_eq!(identity.peer_ids(), vec![PeerId::new(1), PeerId::new(2)]);
        assert_eq!(identity.reachable_peers()[0].domain.as_deref(), Some("hub"));
    }
}
