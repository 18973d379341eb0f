//! Server-owned collection of hosted consensus groups.
//!
//! The map lock only guards lookup and enumeration; each group has its own lock for
//! the hot path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::group::{ConsensusGroup, GroupStatus};
use crate::types::*;

/// Every consensus group hosted on this server, keyed by name.
#[derive(Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<ConsensusGroup>>>,
}

impl GroupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a group; names are unique per server.
    pub fn insert(&self, group: Arc<ConsensusGroup>) -> Result<(), ConsensusError> {
        let mut groups = self.groups.write();
        if groups.contains_key(group.name()) {
            return Err(ConsensusError::GroupExists(group.name().to_string()));
        }
        tracing::debug!(group = %group.name(), kind = %group.kind(), "registered consensus group");
        groups.insert(group.name().to_string(), group);
        Ok(())
    }

    /// Looks up a group by name.
    pub fn get(&self, name: &str) -> Result<Arc<ConsensusGroup>, ConsensusError> {
        self.groups
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownGroup(name.to_string()))
    }

    /// Removes a group, returning it so the caller can stop its driver.
    pub fn remove(&self, name: &str) -> Option<Arc<ConsensusGroup>> {
        let removed = self.groups.write().remove(name);
        if removed.is_some() {
            tracing::debug!(group = %name, "removed consensus group");
        }
        removed
    }

    /// Whether a group with this name is hosted here.
    pub fn contains(&self, name: &str) -> bool {
        self.groups.read().contains_key(name)
    }

    /// The metadata group, once created.
    pub fn meta(&self) -> Option<Arc<ConsensusGroup>> {
        self.groups.read().get(META_GROUP).cloned()
    }

    /// Snapshot of every hosted group.
    pub fn all(&self) -> Vec<Arc<ConsensusGroup>> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    /// Every hosted group except the metadata group.
    pub fn non_meta(&self) -> Vec<Arc<ConsensusGroup>> {
        self.all()
            .into_iter()
            .filter(|g| g.kind() != GroupKind::Meta)
            .collect()
    }

    /// Non-metadata groups whose voter set includes any of `peers`.
    pub fn depending_on(&self, peers: &[PeerId]) -> Vec<Arc<ConsensusGroup>> {
        self.non_meta()
            .into_iter()
            .filter(|g| peers.iter().any(|p| g.has_member(*p)))
            .collect()
    }

    /// Status of every hosted group.
    pub fn statuses(&self) -> Vec<GroupStatus> {
        self.all().iter().map(|g| g.status()).collect()
    }

    /// Number of hosted groups.
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Returns true if no groups are hosted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
