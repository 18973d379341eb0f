//! One configured bridge remote: connection state, lost peers and the migrate timer.
//!
//! All mutation happens under the remote's own lock. The migrate timer is a task handle
//! owned by the remote; it is cancelled under the same lock, and a generation counter
//! makes a timer that already woke up harmless after a reconnect.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use streamlink_consensus::{GroupOp, GroupRegistry, PeerId};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteConfig;
use crate::error::BridgeError;
use crate::identity::{DeploymentIdentity, ExtensionDecision};

/// Connection state of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// Dialing, no identity exchanged yet
    Connecting,
    /// Identity exchanged
    Connected,
    /// Link lost; waiting for the transport to redial
    Disconnected,
    /// Stopped for good
    Shutdown,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteState::Connecting => write!(f, "connecting"),
            RemoteState::Connected => write!(f, "connected"),
            RemoteState::Disconnected => write!(f, "disconnected"),
            RemoteState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Result of moving assets off peers lost with a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Removals proposed, as (group, peer)
    pub removed: Vec<(String, PeerId)>,
    /// Groups that could not propose because they lack a local leader
    pub stalled: Vec<String>,
}

struct MigrateTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct RemoteInner {
    state: RemoteState,
    identity: Option<DeploymentIdentity>,
    decision: Option<ExtensionDecision>,
    lost_peers: BTreeSet<PeerId>,
    dependent: BTreeSet<String>,
    timer: Option<MigrateTimer>,
    generation: u64,
    migration: Option<MigrationReport>,
    connects: u64,
}

/// State of one configured remote.
pub struct BridgeRemote {
    index: usize,
    config: RemoteConfig,
    system: bool,
    cancel: CancellationToken,
    inner: Mutex<RemoteInner>,
}

impl BridgeRemote {
    /// A remote in the connecting state.
    pub fn new(index: usize, config: RemoteConfig, system: bool) -> Self {
        Self {
            index,
            config,
            system,
            cancel: CancellationToken::new(),
            inner: Mutex::new(RemoteInner {
                state: RemoteState::Connecting,
                identity: None,
                decision: None,
                lost_peers: BTreeSet::new(),
                dependent: BTreeSet::new(),
                timer: None,
                generation: 0,
                migration: None,
                connects: 0,
            }),
        }
    }

    /// Position in the configuration.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Remote configuration.
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Whether the remote is bound to the system account.
    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Cancelled when the remote shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current connection state.
    pub fn state(&self) -> RemoteState {
        self.inner.lock().state
    }

    /// Identity of the far side from the latest connect.
    pub fn identity(&self) -> Option<DeploymentIdentity> {
        self.inner.lock().identity.clone()
    }

    /// Extension decision from the latest connect.
    pub fn decision(&self) -> Option<ExtensionDecision> {
        self.inner.lock().decision
    }

    /// Peers lost with the latest disconnect.
    pub fn lost_peers(&self) -> Vec<PeerId> {
        self.inner.lock().lost_peers.iter().copied().collect()
    }

    /// Groups marked link-lost on behalf of this remote.
    pub fn dependent_groups(&self) -> Vec<String> {
        self.inner.lock().dependent.iter().cloned().collect()
    }

    /// Whether a migrate timer is armed.
    pub fn migration_pending(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Outcome of the migration that ran since the last connect, if any.
    pub fn last_migration(&self) -> Option<MigrationReport> {
        self.inner.lock().migration.clone()
    }

    /// Number of successful connects.
    pub fn connects(&self) -> u64 {
        self.inner.lock().connects
    }

    /// Record a connect. Cancels any migrate timer and returns the groups that were
    /// demoted for this remote so the caller can restore them.
    pub fn on_connected(
        &self,
        identity: DeploymentIdentity,
        decision: ExtensionDecision,
    ) -> Result<Vec<String>, BridgeError> {
        let mut inner = self.inner.lock();
        if inner.state == RemoteState::Shutdown {
            return Err(BridgeError::RemoteShutdown(self.index));
        }
        if let Some(timer) = inner.timer.take() {
            tracing::info!(remote = self.index, "reconnect cancelled pending migration");
            timer.handle.abort();
        }
        inner.generation += 1;
        inner.state = RemoteState::Connected;
        inner.connects += 1;
        tracing::info!(
            remote = self.index,
            server = %identity.server_name,
            id = %identity.id,
            domain = ?identity.domain,
            decision = ?decision,
            "bridge remote connected"
        );
        inner.identity = Some(identity);
        inner.decision = Some(decision);
        inner.lost_peers.clear();
        inner.migration = None;
        Ok(std::mem::take(&mut inner.dependent).into_iter().collect())
    }

    /// Record a disconnect. Returns the identity and decision of the lost link, or
    /// `None` if the remote was not connected.
    pub fn on_disconnected(
        &self,
    ) -> Result<Option<(DeploymentIdentity, ExtensionDecision)>, BridgeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            RemoteState::Shutdown => Err(BridgeError::RemoteShutdown(self.index)),
            RemoteState::Connected => {
                inner.state = RemoteState::Disconnected;
                tracing::warn!(remote = self.index, "bridge remote disconnected");
                let lost = inner.identity.clone().zip(inner.decision);
                if let Some((identity, _)) = &lost {
                    inner.lost_peers = identity.peer_ids().into_iter().collect();
                }
                Ok(lost)
            }
            _ => Ok(None),
        }
    }

    /// The transport started redialing.
    pub fn on_reconnecting(&self) {
        let mut inner = self.inner.lock();
        if inner.state == RemoteState::Disconnected {
            inner.state = RemoteState::Connecting;
        }
    }

    /// Remember groups marked link-lost for this remote.
    pub fn record_dependent(&self, groups: impl IntoIterator<Item = String>) {
        self.inner.lock().dependent.extend(groups);
    }

    /// Arm the single-shot migrate timer. A later connect or shutdown cancels it.
    pub fn arm_migrate_timer(self: &Arc<Self>, delay: Duration, groups: Arc<GroupRegistry>) {
        let mut inner = self.inner.lock();
        if inner.state != RemoteState::Disconnected {
            return;
        }
        if let Some(old) = inner.timer.take() {
            old.handle.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        let remote = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remote.migrate(generation, &groups, Instant::now());
        });
        tracing::debug!(remote = self.index, delay_ms = delay.as_millis() as u64, "migrate timer armed");
        inner.timer = Some(MigrateTimer { generation, handle });
    }

    /// Fired by the migrate timer. Ignored when a reconnect or shutdown got there first.
    pub fn migrate(
        &self,
        generation: u64,
        groups: &GroupRegistry,
        now: Instant,
    ) -> Option<MigrationReport> {
        let mut inner = self.inner.lock();
        let current = inner.timer.as_ref().map(|t| t.generation);
        if current != Some(generation) || inner.state == RemoteState::Connected {
            tracing::debug!(remote = self.index, generation, "stale migrate timer ignored");
            return None;
        }
        inner.timer = None;

        let lost: Vec<PeerId> = inner.lost_peers.iter().copied().collect();
        let names: Vec<String> = inner.dependent.iter().cloned().collect();
        let report = migrate_groups(&names, &lost, groups, now);
        for (name, _) in &report.removed {
            inner.dependent.remove(name);
        }
        tracing::info!(
            remote = self.index,
            removed = report.removed.len(),
            stalled = report.stalled.len(),
            "migration off lost peers finished"
        );
        inner.migration = Some(report.clone());
        Some(report)
    }

    /// Stop the remote for good. Cancels the migrate timer and demotes `dependent`
    /// groups, or proposes removal of lost peers when migration already ran.
    pub fn shutdown(&self, dependent: &[String], groups: &GroupRegistry, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state == RemoteState::Shutdown {
            return;
        }
        inner.state = RemoteState::Shutdown;
        self.cancel.cancel();
        if let Some(timer) = inner.timer.take() {
            timer.handle.abort();
        }
        inner.generation += 1;

        if inner.migration.is_some() {
            let lost: Vec<PeerId> = inner.lost_peers.iter().copied().collect();
            let report = migrate_groups(dependent, &lost, groups, now);
            inner.migration = Some(report);
        } else {
            for name in dependent {
                if let Ok(group) = groups.get(name) {
                    if let Err(e) = group.set_observer(true, now) {
                        tracing::debug!(group = %name, error = %e, "group stays a voter");
                    }
                }
            }
        }
        inner.dependent.extend(dependent.iter().cloned());
        tracing::info!(remote = self.index, groups = dependent.len(), "bridge remote shut down");
    }
}

/// Leaders still holding a quorum propose removal of every lost member; everything else
/// is reported stalled.
fn migrate_groups(
    names: &[String],
    lost: &[PeerId],
    groups: &GroupRegistry,
    now: Instant,
) -> MigrationReport {
    let mut report = MigrationReport::default();
    for name in names {
        let group = match groups.get(name) {
            Ok(group) => group,
            Err(_) => continue,
        };
        if !group.is_leader() || group.is_observer() {
            tracing::warn!(group = %name, "cannot migrate off lost peers without a local leader");
            report.stalled.push(name.clone());
            continue;
        }
        let mut proposed = false;
        for peer in lost {
            if !group.has_member(*peer) {
                continue;
            }
            match group.propose(GroupOp::RemovePeer { peer: *peer }) {
                Ok(_) => {
                    report.removed.push((name.clone(), *peer));
                    proposed = true;
                }
                Err(e) => {
                    tracing::warn!(group = %name, peer = %peer, error = %e, "peer removal failed");
                }
            }
        }
        if proposed {
            if let Err(e) = group.clear_link_lost(now) {
                tracing::warn!(group = %name, error = %e, "failed to clear link loss");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlink_consensus::{
        ConsensusGroup, GroupKind, MemLogStore, PeerInfo, RaftConfig,
    };

    fn identity(id: u64) -> DeploymentIdentity {
        DeploymentIdentity {
            server_name: format!("HUB-{}", id),
            id: PeerId::new(id),
            domain: None,
            cluster: "HUB".into(),
            jetstream: true,
            peers: vec![PeerInfo::new(PeerId::new(id + 1), "HUB-2", "HUB")],
        }
    }

    fn remote() -> Arc<BridgeRemote> {
        Arc::new(BridgeRemote::new(
            0,
            RemoteConfig::new("nats://hub:7422", "$SYS"),
            true,
        ))
    }

    /// Single-member group led locally, with the lost peer 10 also recorded as a member.
    fn led_group(name: &str, now: Instant) -> Arc<ConsensusGroup> {
        let group = ConsensusGroup::new(
            name,
            GroupKind::Stream,
            RaftConfig {
                local_id: PeerId::new(1),
                peers: Vec::new(),
                ..RaftConfig::default()
            },
            Arc::new(MemLogStore::new()),
            now,
        )
        .unwrap();
        group.tick(now + Duration::from_millis(301)).unwrap();
        group.propose(GroupOp::AddPeer { peer: PeerId::new(10) }).unwrap();
        group.take_committed();
        Arc::new(group)
    }

    #[test]
    fn test_state_transitions() {
        let r = remote();
        assert_eq!(r.state(), RemoteState::Connecting);
        assert_eq!(r.on_disconnected().unwrap(), None);

        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        assert_eq!(r.state(), RemoteState::Connected);

        let (lost, decision) = r.on_disconnected().unwrap().unwrap();
        assert_eq!(lost.id, PeerId::new(10));
        assert_eq!(decision, ExtensionDecision::Extend);
        assert_eq!(r.lost_peers(), vec![PeerId::new(10), PeerId::new(11)]);

        r.on_reconnecting();
        assert_eq!(r.state(), RemoteState::Connecting);
        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        assert_eq!(r.connects(), 2);
        assert!(r.lost_peers().is_empty());
    }

    #[test]
    fn test_connect_returns_demoted_groups() {
        let r = remote();
        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        r.on_disconnected().unwrap();
        r.record_dependent(vec!["ORDERS".to_string()]);
        let restored = r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        assert_eq!(restored, vec!["ORDERS".to_string()]);
        assert!(r.dependent_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_migrate_timer() {
        let now = Instant::now();
        let groups = Arc::new(GroupRegistry::new());
        groups.insert(led_group("ORDERS", now)).unwrap();

        let r = remote();
        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        r.on_disconnected().unwrap();
        r.record_dependent(vec!["ORDERS".to_string()]);
        r.arm_migrate_timer(Duration::from_millis(500), groups.clone());
        assert!(r.migration_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        assert!(!r.migration_pending());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(r.last_migration(), None);
        assert!(groups.get("ORDERS").unwrap().has_member(PeerId::new(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_migrate_timer_removes_lost_peers() {
        let now = Instant::now();
        let groups = Arc::new(GroupRegistry::new());
        groups.insert(led_group("ORDERS", now)).unwrap();

        let r = remote();
        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        r.on_disconnected().unwrap();
        r.record_dependent(vec!["ORDERS".to_string(), "GONE".to_string()]);
        r.arm_migrate_timer(Duration::from_millis(500), groups.clone());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let report = r.last_migration().unwrap();
        assert_eq!(report.removed, vec![("ORDERS".to_string(), PeerId::new(10))]);
        assert!(!r.migration_pending());
        assert_eq!(r.dependent_groups(), vec!["GONE".to_string()]);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let now = Instant::now();
        let groups = GroupRegistry::new();
        let r = remote();
        r.on_connected(identity(10), ExtensionDecision::Extend).unwrap();
        r.on_disconnected().unwrap();
        assert_eq!(r.migrate(7, &groups, now), None);
    }

    #[test]
    fn test_shutdown_demotes_and_rejects_events() {
        let now = Instant::now();
        let groups = GroupRegistry::new();
        let group = Arc::new(
            ConsensusGroup::new(
                "ORDERS",
                GroupKind::Stream,
                RaftConfig {
                    local_id: PeerId::new(1),
                    peers: vec![PeerId::new(10)],
                    ..RaftConfig::default()
                },
                Arc::new(MemLogStore::new()),
                now,
            )
            .unwrap(),
        );
        groups.insert(group.clone()).unwrap();

        let r = remote();
        r.shutdown(&["ORDERS".to_string()], &groups, now);
        assert!(group.is_observer());
        assert!(r.cancel_token().is_cancelled());
        assert!(matches!(
            r.on_connected(identity(10), ExtensionDecision::Extend),
            Err(BridgeError::RemoteShutdown(0))
        ));
    }
}
