//! Known peers per cluster and domain, and their liveness.
//!
//! Peers are keyed by id. Display names are not unique: the name index resolves a name
//! to the most recently reported id and collisions are kept for diagnostics.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// Information about a known server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique server identifier.
    pub id: PeerId,
    /// Configured display name.
    pub name: String,
    /// Domain the server belongs to, if any.
    pub domain: Option<String>,
    /// Cluster the server belongs to.
    pub cluster: String,
    /// Whether the server is currently reachable.
    pub reachable: bool,
    /// Whether the server only observes.
    pub observer: bool,
    /// Whether the server hosts streams.
    pub jetstream: bool,
}

impl PeerInfo {
    /// A reachable, stream-capable voter.
    pub fn new(id: PeerId, name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            domain: None,
            cluster: cluster.into(),
            reachable: true,
            observer: false,
            jetstream: true,
        }
    }

    /// Sets the domain.
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Whether this peer can host a new replica.
    pub fn is_eligible(&self) -> bool {
        self.reachable && !self.observer && self.jetstream
    }
}

/// Several ids reported under one display name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NameCollision {
    /// The shared display name.
    pub name: String,
    /// Every id seen with this name.
    pub ids: Vec<PeerId>,
}

/// Events emitted by registry changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer was seen for the first time.
    Joined {
        /// Peer id
        id: PeerId,
    },
    /// A peer became unreachable.
    Unreachable {
        /// Peer id
        id: PeerId,
    },
    /// An unreachable peer came back.
    Recovered {
        /// Peer id
        id: PeerId,
    },
    /// A second id was reported under an existing name.
    NameCollision {
        /// Shared name
        name: String,
        /// Id now resolved for the name
        id: PeerId,
    },
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<PeerId, PeerInfo>,
    by_name: HashMap<String, PeerId>,
    names_seen: BTreeMap<String, BTreeSet<PeerId>>,
    events: Vec<PeerEvent>,
}

/// Registry of peers shared by bridge handlers and placement.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a peer. Returns true if the id was new.
    pub fn upsert(&self, info: PeerInfo) -> bool {
        let mut inner = self.inner.write();
        let id = info.id;
        let name = info.name.clone();

        let seen = inner.names_seen.entry(name.clone()).or_default();
        seen.insert(id);
        let collides = seen.len() > 1;

        let previous = inner.by_name.insert(name.clone(), id);
        if collides && previous != Some(id) {
            tracing::warn!(name = %name, id = %id, previous = ?previous, "peer name reported by more than one id");
            inner.events.push(PeerEvent::NameCollision {
                name: name.clone(),
                id,
            });
        }

        let was_reachable = inner.peers.get(&id).map(|p| p.reachable);
        let fresh = inner.peers.insert(id, info.clone()).is_none();
        if fresh {
            tracing::info!(
                id = %id,
                name = %name,
                cluster = %info.cluster,
                domain = ?info.domain,
                "peer joined registry"
            );
            inner.events.push(PeerEvent::Joined { id });
        } else if was_reachable == Some(false) && info.reachable {
            inner.events.push(PeerEvent::Recovered { id });
        }
        fresh
    }

    /// Updates reachability. Returns false for unknown peers.
    pub fn set_reachable(&self, id: PeerId, reachable: bool) -> bool {
        let mut inner = self.inner.write();
        let changed = match inner.peers.get_mut(&id) {
            Some(peer) if peer.reachable != reachable => {
                peer.reachable = reachable;
                true
            }
            Some(_) => false,
            None => return false,
        };
        if changed {
            tracing::debug!(id = %id, reachable, "peer reachability changed");
            inner.events.push(if reachable {
                PeerEvent::Recovered { id }
            } else {
                PeerEvent::Unreachable { id }
            });
        }
        true
    }

    /// Updates the observer flag. Returns false for unknown peers.
    pub fn set_observer(&self, id: PeerId, observer: bool) -> bool {
        match self.inner.write().peers.get_mut(&id) {
            Some(peer) => {
                peer.observer = observer;
                true
            }
            None => false,
        }
    }

    /// Forgets a peer. The name index falls back to another id with that name.
    pub fn remove(&self, id: PeerId) -> Option<PeerInfo> {
        let mut inner = self.inner.write();
        let removed = inner.peers.remove(&id)?;
        if let Some(seen) = inner.names_seen.get_mut(&removed.name) {
            seen.remove(&id);
        }
        let fallback = inner
            .names_seen
            .get(&removed.name)
            .and_then(|seen| seen.iter().next_back().copied());
        if inner.by_name.get(&removed.name) == Some(&id) {
            match fallback {
                Some(other) => {
                    inner.by_name.insert(removed.name.clone(), other);
                }
                None => {
                    inner.by_name.remove(&removed.name);
                }
            }
        }
        Some(removed)
    }

    /// Looks up a peer by id.
    pub fn get(&self, id: PeerId) -> Option<PeerInfo> {
        self.inner.read().peers.get(&id).cloned()
    }

    /// Resolves a display name to the id most recently reported for it.
    pub fn id_for_name(&self, name: &str) -> Option<PeerId> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Every known peer, ordered by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.inner.read().peers.values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Name to id view, one entry per name.
    pub fn names(&self) -> BTreeMap<String, PeerId> {
        self.inner
            .read()
            .by_name
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Names reported by more than one known id.
    pub fn name_collisions(&self) -> Vec<NameCollision> {
        let inner = self.inner.read();
        inner
            .names_seen
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(name, ids)| NameCollision {
                name: name.clone(),
                ids: ids.iter().copied().collect(),
            })
            .collect()
    }

    /// Peers in `cluster` that can host a replica, ordered by id.
    pub fn eligible_in_cluster(&self, cluster: &str) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self
            .inner
            .read()
            .peers
            .values()
            .filter(|p| p.cluster == cluster && p.is_eligible())
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Whether any peer is known in `cluster`.
    pub fn knows_cluster(&self, cluster: &str) -> bool {
        self.inner.read().peers.values().any(|p| p.cluster == cluster)
    }

    /// The cluster in `domain` with the most eligible peers, ties broken by name.
    pub fn domain_cluster(&self, domain: Option<&str>) -> Option<String> {
        let inner = self.inner.read();
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for peer in inner.peers.values() {
            if peer.domain.as_deref() == domain && peer.jetstream {
                let count = counts.entry(peer.cluster.as_str()).or_default();
                if peer.is_eligible() {
                    *count += 1;
                }
            }
        }
        counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(cluster, _)| cluster.to_string())
    }

    /// Peers learned for the given domain.
    pub fn in_domain(&self, domain: Option<&str>) -> Vec<PeerId> {
        let mut ids: Vec<_> = self
            .inner
            .read()
            .peers
            .values()
            .filter(|p| p.domain.as_deref() == domain)
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    /// Drains pending events.
    pub fn take_events(&self) -> Vec<PeerEvent> {
        std::mem::take(&mut self.inner.write().events)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Returns true if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
