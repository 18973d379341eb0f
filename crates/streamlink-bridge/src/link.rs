//! Bridge link lifecycle: extension on connect, demotion on disconnect, migration and
//! shutdown, for both dialed remotes and accepted inbound links.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use streamlink_consensus::{
    ConsensusError, GroupOp, GroupRegistry, PeerId, PeerRegistry,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::BridgeError;
use crate::identity::{decide_extension, DeploymentIdentity, ExtensionDecision};
use crate::remote::{BridgeRemote, RemoteState};

/// What the transport reports for a dialed remote.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake finished; carries the far side's identity
    Connected(DeploymentIdentity),
    /// Connection lost
    Disconnected,
    /// Transport is redialing
    Reconnecting,
}

/// Connectivity changes published to the rest of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A bridge came up
    Up {
        /// Far-side server
        remote: PeerId,
        /// Far-side domain
        domain: Option<String>,
        /// Whether membership was merged
        decision: ExtensionDecision,
    },
    /// A bridge went down
    Down {
        /// Far-side server
        remote: PeerId,
        /// Far-side domain
        domain: Option<String>,
        /// Whether membership was merged
        decision: ExtensionDecision,
    },
}

/// Shared state the link handlers act on.
#[derive(Clone)]
pub struct LinkContext {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Id of this server
    pub local_id: PeerId,
    /// Known peers
    pub peers: Arc<PeerRegistry>,
    /// Hosted consensus groups
    pub groups: Arc<GroupRegistry>,
}

struct InboundLink {
    identity: DeploymentIdentity,
    decision: ExtensionDecision,
    connected: bool,
    dependent: BTreeSet<String>,
}

/// Every bridge of one server.
pub struct BridgeLinks {
    ctx: LinkContext,
    remotes: Vec<Arc<BridgeRemote>>,
    senders: Mutex<Vec<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    inbound: Mutex<HashMap<PeerId, InboundLink>>,
    pending_joins: Mutex<BTreeMap<PeerId, Option<Instant>>>,
    events: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<usize, JoinHandle<()>>>,
}

const TICK_TASK: usize = usize::MAX;

impl BridgeLinks {
    /// One remote per configured entry, all connecting.
    pub fn new(ctx: LinkContext) -> Self {
        let remotes: Vec<_> = ctx
            .config
            .remotes
            .iter()
            .enumerate()
            .map(|(index, remote)| {
                let system = ctx.config.is_system_remote(remote);
                Arc::new(BridgeRemote::new(index, remote.clone(), system))
            })
            .collect();
        let (events, _) = broadcast::channel(256);
        Self {
            senders: Mutex::new(vec![None; remotes.len()]),
            ctx,
            remotes,
            inbound: Mutex::new(HashMap::new()),
            pending_joins: Mutex::new(BTreeMap::new()),
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Identity this server presents on connect.
    pub fn local_identity(&self) -> DeploymentIdentity {
        let config = &self.ctx.config;
        let cluster = config.cluster_name();
        let domain = config.domain();
        let peers = self
            .ctx
            .peers
            .peers()
            .into_iter()
            .filter(|p| p.cluster == cluster && p.domain == domain)
            .collect();
        DeploymentIdentity {
            server_name: config.server_name.clone(),
            id: self.ctx.local_id,
            domain,
            cluster,
            jetstream: config.jetstream.enabled,
            peers,
        }
    }

    /// Subscribe to connectivity changes.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Configured remotes.
    pub fn remotes(&self) -> &[Arc<BridgeRemote>] {
        &self.remotes
    }

    /// Remote by configuration index.
    pub fn remote(&self, index: usize) -> Result<&Arc<BridgeRemote>, BridgeError> {
        self.remotes
            .get(index)
            .ok_or(BridgeError::UnknownRemote(index))
    }

    /// Sender feeding the event loop of a remote, once started.
    pub fn sender(&self, index: usize) -> Option<mpsc::UnboundedSender<TransportEvent>> {
        self.senders.lock().get(index).cloned().flatten()
    }

    /// Inbound peers whose join into the metadata group is still outstanding.
    pub fn pending_joins(&self) -> Vec<PeerId> {
        self.pending_joins.lock().keys().copied().collect()
    }

    /// Ids of accepted inbound links that are currently connected.
    pub fn inbound_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self
            .inbound
            .lock()
            .iter()
            .filter(|(_, link)| link.connected)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Spawn one event loop per remote and the link ticker.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        let mut senders = self.senders.lock();
        for remote in &self.remotes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders[remote.index()] = Some(tx);
            let handle = tokio::spawn(Arc::clone(self).remote_loop(Arc::clone(remote), rx));
            tasks.insert(remote.index(), handle);
        }
        let period = Duration::from_millis((self.ctx.config.consensus.election_timeout_min_ms / 2).max(10));
        tasks.insert(TICK_TASK, tokio::spawn(Arc::clone(self).tick_loop(period)));
        tracing::info!(remotes = self.remotes.len(), "bridge links started");
    }

    async fn remote_loop(
        self: Arc<Self>,
        remote: Arc<BridgeRemote>,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let index = remote.index();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = remote.cancel_token().cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(index, event) {
                            tracing::warn!(remote = index, error = %e, "bridge event failed");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(remote = index, "bridge remote event loop stopped");
    }

    async fn tick_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
    }

    /// Dispatch one transport event for a remote.
    pub fn handle_event(&self, index: usize, event: TransportEvent) -> Result<(), BridgeError> {
        match event {
            TransportEvent::Connected(identity) => self.handle_connect(index, identity).map(|_| ()),
            TransportEvent::Disconnected => self.handle_disconnect(index),
            TransportEvent::Reconnecting => {
                self.remote(index)?.on_reconnecting();
                Ok(())
            }
        }
    }

    fn decide(&self, system_link: bool, remote_domain: Option<&str>) -> ExtensionDecision {
        let config = &self.ctx.config;
        decide_extension(
            config.jetstream.extension_hint,
            system_link,
            config.domain().as_deref(),
            remote_domain,
        )
    }

    /// A dialed remote finished its handshake.
    pub fn handle_connect(
        &self,
        index: usize,
        identity: DeploymentIdentity,
    ) -> Result<ExtensionDecision, BridgeError> {
        let now = Instant::now();
        let remote = self.remote(index)?;
        let decision = self.decide(remote.is_system(), identity.domain.as_deref());
        let demoted = remote.on_connected(identity.clone(), decision)?;

        self.restore_groups(&demoted, now);
        self.refresh_local_observer();
        if decision == ExtensionDecision::Extend {
            self.import_peers(&identity);
            self.join_remote_meta(&identity, now)?;
        }
        self.publish(LinkEvent::Up {
            remote: identity.id,
            domain: identity.domain,
            decision,
        });
        Ok(decision)
    }

    /// A dialed remote lost its connection.
    pub fn handle_disconnect(&self, index: usize) -> Result<(), BridgeError> {
        let now = Instant::now();
        let remote = self.remote(index)?;
        let (identity, decision) = match remote.on_disconnected()? {
            Some(lost) => lost,
            None => return Ok(()),
        };

        let dependent = self.lose(&identity, decision, now);
        remote.record_dependent(dependent);
        if decision == ExtensionDecision::Extend {
            if let Some(delay) = self.ctx.config.jetstream.migrate_delay() {
                remote.arm_migrate_timer(delay, Arc::clone(&self.ctx.groups));
            }
        }
        self.publish(LinkEvent::Down {
            remote: identity.id,
            domain: identity.domain,
            decision,
        });
        Ok(())
    }

    /// A remote server dialed us and finished its handshake.
    pub fn handle_inbound_connect(
        &self,
        account: &str,
        identity: DeploymentIdentity,
    ) -> ExtensionDecision {
        let now = Instant::now();
        let system = account == self.ctx.config.system_account;
        let decision = self.decide(system, identity.domain.as_deref());
        tracing::info!(
            server = %identity.server_name,
            id = %identity.id,
            account = %account,
            decision = ?decision,
            "accepted bridge connection"
        );

        let demoted = {
            let mut inbound = self.inbound.lock();
            let link = inbound.entry(identity.id).or_insert_with(|| InboundLink {
                identity: identity.clone(),
                decision,
                connected: false,
                dependent: BTreeSet::new(),
            });
            link.identity = identity.clone();
            link.decision = decision;
            link.connected = true;
            std::mem::take(&mut link.dependent)
        };
        let demoted: Vec<String> = demoted.into_iter().collect();
        self.restore_groups(&demoted, now);
        self.refresh_local_observer();

        if decision == ExtensionDecision::Extend {
            self.import_peers(&identity);
            let already_member = self
                .ctx
                .groups
                .meta()
                .map(|meta| meta.has_member(identity.id))
                .unwrap_or(false);
            if !already_member {
                self.pending_joins.lock().insert(identity.id, None);
                self.try_join(identity.id, now);
            }
        }
        self.publish(LinkEvent::Up {
            remote: identity.id,
            domain: identity.domain,
            decision,
        });
        decision
    }

    /// An accepted link went away.
    pub fn handle_inbound_disconnect(&self, remote: PeerId) {
        let now = Instant::now();
        let lost = {
            let mut inbound = self.inbound.lock();
            match inbound.get_mut(&remote) {
                Some(link) if link.connected => {
                    link.connected = false;
                    Some((link.identity.clone(), link.decision))
                }
                _ => None,
            }
        };
        let (identity, decision) = match lost {
            Some(lost) => lost,
            None => return,
        };
        tracing::warn!(server = %identity.server_name, id = %remote, "accepted bridge connection lost");
        self.pending_joins.lock().remove(&remote);

        let dependent = self.lose(&identity, decision, now);
        if let Some(link) = self.inbound.lock().get_mut(&remote) {
            link.dependent.extend(dependent);
        }
        self.publish(LinkEvent::Down {
            remote: identity.id,
            domain: identity.domain,
            decision,
        });
    }

    /// Stop one remote. Its event loop ends and the groups it served are demoted.
    pub fn shutdown_remote(&self, index: usize) -> Result<(), BridgeError> {
        let now = Instant::now();
        let remote = self.remote(index)?;
        let mut dependent: BTreeSet<String> = remote.dependent_groups().into_iter().collect();
        if let (Some(identity), Some(ExtensionDecision::Extend)) = (remote.identity(), remote.decision()) {
            dependent.extend(self.dependent_groups(&identity));
        }
        let dependent: Vec<String> = dependent.into_iter().collect();
        remote.shutdown(&dependent, &self.ctx.groups, now);
        if let Some(handle) = self.tasks.lock().remove(&index) {
            handle.abort();
        }
        if let Some(sender) = self.senders.lock().get_mut(index) {
            *sender = None;
        }
        Ok(())
    }

    /// Stop every remote and background task.
    pub fn shutdown(&self) {
        for index in 0..self.remotes.len() {
            if let Err(e) = self.shutdown_remote(index) {
                tracing::warn!(remote = index, error = %e, "remote shutdown failed");
            }
        }
        self.cancel.cancel();
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }

    /// Retry outstanding joins and forget completed ones.
    pub fn tick(&self, now: Instant) {
        let meta = match self.ctx.groups.meta() {
            Some(meta) => meta,
            None => return,
        };
        let retry_after = self.ctx.config.consensus.election_timeout_max() * 2;
        let due: Vec<PeerId> = {
            let mut pending = self.pending_joins.lock();
            pending.retain(|peer, _| {
                let joined = meta.has_member(*peer);
                if joined {
                    tracing::info!(peer = %peer, "remote server joined metadata group");
                }
                !joined
            });
            pending
                .iter()
                .filter(|(_, last)| match last {
                    None => true,
                    Some(at) => now.duration_since(*at) >= retry_after,
                })
                .map(|(peer, _)| *peer)
                .collect()
        };
        for peer in due {
            self.try_join(peer, now);
        }
    }

    fn try_join(&self, peer: PeerId, now: Instant) {
        let meta = match self.ctx.groups.meta() {
            Some(meta) => meta,
            None => return,
        };
        let attempt = match meta.propose_or_forward(GroupOp::AddPeer { peer }) {
            Ok(()) => {
                tracing::info!(peer = %peer, "proposed adding remote server to metadata group");
                Some(now)
            }
            Err(ConsensusError::NoLeader { .. }) => {
                tracing::debug!(peer = %peer, "no metadata leader yet, join stays pending");
                None
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "metadata join proposal failed");
                None
            }
        };
        if let Some(last) = self.pending_joins.lock().get_mut(&peer) {
            *last = attempt;
        }
    }

    fn join_remote_meta(&self, identity: &DeploymentIdentity, now: Instant) -> Result<(), BridgeError> {
        if let Some(meta) = self.ctx.groups.meta() {
            if !meta.has_member(identity.id) {
                tracing::info!(remote = %identity.id, "joining remote metadata group");
                meta.reset_for_join(now)?;
            }
        }
        Ok(())
    }

    fn import_peers(&self, identity: &DeploymentIdentity) {
        for peer in identity.reachable_peers() {
            if peer.id != self.ctx.local_id {
                self.ctx.peers.upsert(peer);
            }
        }
    }

    fn lost_ids(&self, identity: &DeploymentIdentity) -> Vec<PeerId> {
        identity
            .peer_ids()
            .into_iter()
            .filter(|id| *id != self.ctx.local_id)
            .collect()
    }

    /// Groups that need the far side of an extended link.
    fn dependent_groups(&self, identity: &DeploymentIdentity) -> Vec<String> {
        let lost = self.lost_ids(identity);
        let mut names: BTreeSet<String> = self
            .ctx
            .groups
            .depending_on(&lost)
            .iter()
            .map(|g| g.name().to_string())
            .collect();
        if self.ctx.config.jetstream.observer_on_remote_loss {
            names.extend(self.ctx.groups.non_meta().iter().map(|g| g.name().to_string()));
        }
        names.into_iter().collect()
    }

    /// Mark the far side unreachable and its dependent groups link-lost.
    fn lose(&self, identity: &DeploymentIdentity, decision: ExtensionDecision, now: Instant) -> Vec<String> {
        if decision != ExtensionDecision::Extend {
            return Vec::new();
        }
        let lost = self.lost_ids(identity);
        for id in &lost {
            self.ctx.peers.set_reachable(*id, false);
        }
        let force = self.ctx.config.jetstream.observer_on_remote_loss;
        let mut marked = Vec::new();
        for name in self.dependent_groups(identity) {
            if let Ok(group) = self.ctx.groups.get(&name) {
                if group.mark_link_lost(now, force) {
                    marked.push(name);
                }
            }
        }
        tracing::info!(lost = ?lost, groups = marked.len(), force, "bridge loss marked dependent groups");
        self.refresh_local_observer();
        marked
    }

    /// Whether an extended link, dialed or accepted, is currently down.
    fn extended_link_down(&self) -> bool {
        let dialed = self.remotes.iter().any(|r| {
            r.decision() == Some(ExtensionDecision::Extend) && r.state() != RemoteState::Connected
        });
        dialed
            || self
                .inbound
                .lock()
                .values()
                .any(|link| link.decision == ExtensionDecision::Extend && !link.connected)
    }

    /// With `observer_on_remote_loss`, this server only observes while an extended link
    /// is down, and placement must skip it.
    fn refresh_local_observer(&self) {
        if !self.ctx.config.jetstream.observer_on_remote_loss {
            return;
        }
        let observer = self.extended_link_down();
        let current = self.ctx.peers.get(self.ctx.local_id).map(|p| p.observer);
        if current.is_some_and(|c| c != observer) {
            self.ctx.peers.set_observer(self.ctx.local_id, observer);
            tracing::info!(local_id = %self.ctx.local_id, observer, "local placement eligibility changed");
        }
    }

    fn restore_groups(&self, names: &[String], now: Instant) {
        for name in names {
            match self.ctx.groups.get(name) {
                Ok(group) => {
                    if let Err(e) = group.clear_link_lost(now) {
                        tracing::warn!(group = %name, error = %e, "failed to restore voter status");
                    }
                }
                Err(_) => tracing::debug!(group = %name, "demoted group no longer hosted"),
            }
        }
        if !names.is_empty() {
            tracing::info!(groups = names.len(), "bridge restored, groups back to voting");
        }
    }

    fn publish(&self, event: LinkEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtensionHint, RemoteConfig, DEFAULT_SYSTEM_ACCOUNT};
    use crate::router::DomainRouter;
    use streamlink_consensus::{
        ConsensusGroup, GroupKind, MemLogStore, PeerInfo, RaftConfig, META_GROUP,
    };

    const LOCAL: u64 = 1;

    fn config(hint: ExtensionHint, force: bool) -> ServerConfig {
        let mut config = ServerConfig {
            server_name: "LEAF-1".into(),
            remotes: vec![
                RemoteConfig::new("nats://hub:7422", DEFAULT_SYSTEM_ACCOUNT),
                RemoteConfig::new("nats://hub:7422", "$G"),
            ],
            ..ServerConfig::default()
        };
        config.jetstream.extension_hint = hint;
        config.jetstream.observer_on_remote_loss = force;
        config
    }

    fn group(name: &str, kind: GroupKind, peers: &[u64], now: Instant) -> Arc<ConsensusGroup> {
        Arc::new(
            ConsensusGroup::new(
                name,
                kind,
                RaftConfig {
                    local_id: PeerId::new(LOCAL),
                    peers: peers.iter().map(|p| PeerId::new(*p)).collect(),
                    ..RaftConfig::default()
                },
                Arc::new(MemLogStore::new()),
                now,
            )
            .unwrap(),
        )
    }

    fn links(config: ServerConfig) -> BridgeLinks {
        let now = Instant::now();
        let groups = Arc::new(GroupRegistry::new());
        groups.insert(group(META_GROUP, GroupKind::Meta, &[], now)).unwrap();
        groups.insert(group("SPANS", GroupKind::Stream, &[10, 11], now)).unwrap();
        groups.insert(group("LOCAL", GroupKind::Stream, &[2], now)).unwrap();
        BridgeLinks::new(LinkContext {
            config: Arc::new(config),
            local_id: PeerId::new(LOCAL),
            peers: Arc::new(PeerRegistry::new()),
            groups,
        })
    }

    fn hub(id: u64, domain: Option<&str>) -> DeploymentIdentity {
        DeploymentIdentity {
            server_name: format!("HUB-{}", id),
            id: PeerId::new(id),
            domain: domain.map(String::from),
            cluster: "HUB".into(),
            jetstream: true,
            peers: vec![PeerInfo::new(PeerId::new(id + 1), "HUB-2", "HUB")
                .with_domain(domain.map(String::from))],
        }
    }

    fn elect_meta(links: &BridgeLinks, now: Instant) {
        let meta = links.ctx.groups.meta().unwrap();
        meta.tick(now + Duration::from_millis(301)).unwrap();
        meta.take_committed();
        assert!(meta.is_leader());
    }

    mod extension {
        use super::*;

        #[tokio::test]
        async fn test_system_link_extends_and_imports_peers() {
            let links = links(config(ExtensionHint::Auto, false));
            let mut events = links.subscribe();
            let decision = links.handle_connect(0, hub(10, None)).unwrap();
            assert_eq!(decision, ExtensionDecision::Extend);
            assert_eq!(links.ctx.peers.len(), 2);
            assert!(!links.ctx.groups.meta().unwrap().status().members.contains(&PeerId::new(LOCAL)));
            assert!(matches!(events.try_recv(), Ok(LinkEvent::Up { decision: ExtensionDecision::Extend, .. })));
        }

        #[tokio::test]
        async fn test_application_link_stays_isolated() {
            let links = links(config(ExtensionHint::WillExtend, false));
            let decision = links.handle_connect(1, hub(10, None)).unwrap();
            assert_eq!(decision, ExtensionDecision::Isolate);
            assert!(links.ctx.peers.is_empty());
            assert!(links.ctx.groups.meta().unwrap().has_member(PeerId::new(LOCAL)));
        }

        #[tokio::test]
        async fn test_domain_mismatch_isolates_under_auto() {
            let mut cfg = config(ExtensionHint::Auto, false);
            cfg.jetstream.domain = Some("leaf".into());
            let links = links(cfg);
            assert_eq!(
                links.handle_connect(0, hub(10, Some("hub"))).unwrap(),
                ExtensionDecision::Isolate
            );
            assert!(links.ctx.peers.in_domain(Some("hub")).is_empty());
        }

        #[tokio::test]
        async fn test_inbound_join_waits_for_meta_leader() {
            let now = Instant::now();
            let links = links(config(ExtensionHint::Auto, false));
            let decision = links.handle_inbound_connect(DEFAULT_SYSTEM_ACCOUNT, hub(20, None));
            assert_eq!(decision, ExtensionDecision::Extend);
            assert_eq!(links.pending_joins(), vec![PeerId::new(20)]);

            elect_meta(&links, now);
            links.tick(now);
            let meta = links.ctx.groups.meta().unwrap();
            meta.take_committed();
            assert!(meta.has_member(PeerId::new(20)));

            links.tick(now);
            assert!(links.pending_joins().is_empty());
            assert_eq!(links.inbound_peers(), vec![PeerId::new(20)]);
        }

        #[tokio::test]
        async fn test_inbound_application_account_does_not_join() {
            let links = links(config(ExtensionHint::WillExtend, false));
            assert_eq!(
                links.handle_inbound_connect("$G", hub(20, None)),
                ExtensionDecision::Isolate
            );
            assert!(links.pending_joins().is_empty());
        }
    }

    mod loss {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_disconnect_demotes_dependent_groups_only() {
            let links = links(config(ExtensionHint::Auto, false));
            let mut events = links.subscribe();
            links.handle_connect(0, hub(10, None)).unwrap();
            links.handle_disconnect(0).unwrap();

            assert!(!links.ctx.peers.get(PeerId::new(10)).unwrap().reachable);
            assert_eq!(links.remotes()[0].dependent_groups(), vec!["SPANS".to_string()]);

            let groups = &links.ctx.groups;
            let later = Instant::now() + Duration::from_millis(400);
            for g in groups.all() {
                g.tick(later).unwrap();
            }
            assert!(groups.get("SPANS").unwrap().is_observer());
            assert!(!groups.get("LOCAL").unwrap().is_observer());
            assert!(!groups.meta().unwrap().is_observer());

            events.try_recv().unwrap();
            assert!(matches!(events.try_recv(), Ok(LinkEvent::Down { .. })));

            links.handle_connect(0, hub(10, None)).unwrap();
            assert!(!groups.get("SPANS").unwrap().is_observer());
            assert!(links.ctx.peers.get(PeerId::new(10)).unwrap().reachable);
        }

        #[tokio::test(start_paused = true)]
        async fn test_observer_on_remote_loss_demotes_every_stream() {
            let links = links(config(ExtensionHint::Auto, true));
            links.handle_connect(0, hub(10, None)).unwrap();
            links.handle_disconnect(0).unwrap();
            assert_eq!(
                links.remotes()[0].dependent_groups(),
                vec!["LOCAL".to_string(), "SPANS".to_string()]
            );
            let later = Instant::now() + Duration::from_millis(301);
            for g in links.ctx.groups.non_meta() {
                g.tick(later).unwrap();
                assert!(g.is_observer());
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_forced_observer_is_skipped_by_placement() {
            let links = links(config(ExtensionHint::Auto, true));
            let cluster = links.ctx.config.cluster_name();
            links
                .ctx
                .peers
                .upsert(PeerInfo::new(PeerId::new(LOCAL), "LEAF-1", cluster.clone()));
            let router = DomainRouter::new(Arc::clone(&links.ctx.config), Arc::clone(&links.ctx.peers));
            assert!(router.place_stream("$G", Some(&cluster), 1).is_ok());

            links.handle_connect(0, hub(10, None)).unwrap();
            links.handle_disconnect(0).unwrap();
            assert!(links.ctx.peers.get(PeerId::new(LOCAL)).unwrap().observer);
            let err = router.place_stream("$G", Some(&cluster), 1).unwrap_err();
            assert!(err
                .to_string()
                .contains(&format!("no suitable peers for placement for cluster {}", cluster)));

            links.handle_connect(0, hub(10, None)).unwrap();
            assert!(!links.ctx.peers.get(PeerId::new(LOCAL)).unwrap().observer);
            let placement = router.place_stream("$G", Some(&cluster), 1).unwrap();
            assert_eq!(placement.peers, vec![PeerId::new(LOCAL)]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_loss_without_forced_observer_keeps_local_eligible() {
            let links = links(config(ExtensionHint::Auto, false));
            let cluster = links.ctx.config.cluster_name();
            links
                .ctx
                .peers
                .upsert(PeerInfo::new(PeerId::new(LOCAL), "LEAF-1", cluster));
            links.handle_connect(0, hub(10, None)).unwrap();
            links.handle_disconnect(0).unwrap();
            assert!(!links.ctx.peers.get(PeerId::new(LOCAL)).unwrap().observer);
        }

        #[tokio::test(start_paused = true)]
        async fn test_isolated_loss_touches_no_groups() {
            let links = links(config(ExtensionHint::NoExtend, true));
            links.handle_connect(0, hub(10, None)).unwrap();
            links.handle_disconnect(0).unwrap();
            assert!(links.remotes()[0].dependent_groups().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_migrate_delay_arms_timer() {
            let mut cfg = config(ExtensionHint::Auto, false);
            cfg.jetstream.migrate_delay_ms = Some(1_000);
            let links = links(cfg);
            links.handle_connect(0, hub(10, None)).unwrap();
            links.handle_disconnect(0).unwrap();
            assert!(links.remotes()[0].migration_pending());

            tokio::time::sleep(Duration::from_millis(1_100)).await;
            let report = links.remotes()[0].last_migration().unwrap();
            assert_eq!(report.stalled, vec!["SPANS".to_string()]);
        }

        #[tokio::test]
        async fn test_inbound_loss_and_return() {
            let links = links(config(ExtensionHint::Auto, false));
            let mut spanning = hub(10, None);
            spanning.peers.clear();
            links.handle_inbound_connect(DEFAULT_SYSTEM_ACCOUNT, spanning.clone());
            links.handle_inbound_disconnect(PeerId::new(10));
            assert!(!links.ctx.peers.get(PeerId::new(10)).unwrap().reachable);
            assert!(links.inbound_peers().is_empty());

            links.ctx.groups.get("SPANS").unwrap().set_observer(true, Instant::now()).unwrap();
            links.handle_inbound_connect(DEFAULT_SYSTEM_ACCOUNT, spanning);
            assert!(!links.ctx.groups.get("SPANS").unwrap().is_observer());
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_event_loop_and_shutdown() {
            let links = Arc::new(links(config(ExtensionHint::Auto, false)));
            links.start();
            let tx = links.sender(0).unwrap();
            tx.send(TransportEvent::Connected(hub(10, None))).unwrap();

            let mut events = links.subscribe();
            let _ = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
            assert_eq!(links.remotes()[0].state(), crate::remote::RemoteState::Connected);

            links.shutdown_remote(0).unwrap();
            assert_eq!(links.remotes()[0].state(), crate::remote::RemoteState::Shutdown);
            assert!(links.sender(0).is_none());
            assert!(links.ctx.groups.get("SPANS").unwrap().is_observer());
            assert!(matches!(
                links.handle_disconnect(0),
                Err(BridgeError::RemoteShutdown(0))
            ));
            links.shutdown();
        }

        #[test]
        fn test_unknown_remote() {
            let links = links(config(ExtensionHint::Auto, false));
            assert!(matches!(
                links.handle_event(7, TransportEvent::Reconnecting),
                Err(BridgeError::UnknownRemote(7))
            ));
        }

        #[test]
        fn test_local_identity_lists_own_cluster() {
            let links = links(config(ExtensionHint::Auto, false));
            links.ctx.peers.upsert(PeerInfo::new(PeerId::new(2), "LEAF-2", "LEAF-1"));
            links.ctx.peers.upsert(PeerInfo::new(PeerId::new(10), "HUB-1", "HUB"));
            let identity = links.local_identity();
            assert_eq!(identity.cluster, "LEAF-1");
            assert_eq!(identity.peers.len(), 1);
        }
    }
}
