//! Shared helpers for multi-member consensus tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use streamlink_consensus::{
    Committed, ConsensusGroup, GroupDriver, GroupKind, LocalNetwork, MemLogStore, PeerId,
    RaftConfig, RaftTransport,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A set of members of one group, each driven by its own task.
pub struct TestCluster {
    pub net: Arc<LocalNetwork>,
    pub members: Vec<Arc<ConsensusGroup>>,
    pub drivers: Vec<GroupDriver>,
    pub committed: mpsc::UnboundedReceiver<Committed>,
}

impl TestCluster {
    pub fn new(group: &str, kind: GroupKind, size: u64) -> Self {
        let net = Arc::new(LocalNetwork::new());
        let (tx, committed) = mpsc::unbounded_channel();
        let ids: Vec<PeerId> = (1..=size).map(PeerId::new).collect();
        let mut members = Vec::new();
        let mut drivers = Vec::new();
        for id in &ids {
            let member = Arc::new(
                ConsensusGroup::new(
                    group,
                    kind,
                    RaftConfig {
                        local_id: *id,
                        peers: ids.iter().copied().filter(|p| p != id).collect(),
                        ..RaftConfig::default()
                    },
                    Arc::new(MemLogStore::new()),
                    Instant::now(),
                )
                .unwrap(),
            );
            let inbox = net.register(*id, group);
            let transport: Arc<dyn RaftTransport> = net.clone();
            drivers.push(GroupDriver::spawn(member.clone(), transport, inbox, tx.clone()));
            members.push(member);
        }
        Self {
            net,
            members,
            drivers,
            committed,
        }
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.members.iter().map(|m| m.local_id()).collect()
    }

    pub fn leaders(&self) -> Vec<Arc<ConsensusGroup>> {
        self.members
            .iter()
            .filter(|m| m.is_leader())
            .cloned()
            .collect()
    }

    pub async fn wait_for_leader(&self, within: Duration) -> Option<Arc<ConsensusGroup>> {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            let leaders = self.leaders();
            if leaders.len() == 1 {
                return leaders.into_iter().next();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    pub async fn shutdown(self) {
        for driver in self.drivers {
            driver.shutdown().await;
        }
    }
}
