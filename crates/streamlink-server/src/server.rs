//! The hosting server: owns the peer registry, hosted consensus groups, bridge links,
//! placement, the metadata state machine and the replication engine, and wires them
//! together with a handful of background tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use streamlink_bridge::{
    BridgeLinks, DomainRouter, LinkContext, LinkEvent, PlacementError, ServerConfig,
};
use streamlink_consensus::{
    Committed, ConsensusGroup, FileLogStore, GroupDriver, GroupKind, GroupOp, GroupRegistry,
    LocalNetwork, LogStore, MemLogStore, PeerEvent, PeerId, PeerInfo, PeerRegistry,
    RaftTransport, META_GROUP,
};
use streamlink_repl::{
    DomainDirectory, OriginApi, ReplError, ReplicationEngine, StreamCatalog, StreamConfig,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::meta::{MetaChange, MetaCommand, MetaState, StreamAssignment};
use crate::status::{RemoteStatus, ServerStatus};

/// What a server shares with the rest of its deployment.
#[derive(Clone)]
pub struct Collaborators {
    /// Carries consensus traffic between servers
    pub network: Arc<LocalNetwork>,
    /// Stream APIs of every domain, local and bridged
    pub origins: Arc<DomainDirectory>,
    /// Stream storage of this server's domain
    pub catalog: Arc<StreamCatalog>,
    /// Other servers of the local cluster
    pub cluster: Vec<PeerInfo>,
}

impl Collaborators {
    /// A single server on its own: private network, one catalog registered under the
    /// server's domain.
    pub fn standalone(config: &Config) -> Self {
        let origins = Arc::new(DomainDirectory::new(config.replication.request_timeout()));
        let catalog = Arc::new(StreamCatalog::new());
        origins.add_domain(&config.server.domain().unwrap_or_default(), Arc::clone(&catalog));
        Self {
            network: Arc::new(LocalNetwork::new()),
            origins,
            catalog,
            cluster: Vec::new(),
        }
    }
}

/// One streamlink server.
pub struct Server {
    id: PeerId,
    config: Arc<ServerConfig>,
    status_interval: Duration,
    peers: Arc<PeerRegistry>,
    groups: Arc<GroupRegistry>,
    network: Arc<LocalNetwork>,
    drivers: Mutex<HashMap<String, GroupDriver>>,
    committed_tx: mpsc::UnboundedSender<Committed>,
    links: Arc<BridgeLinks>,
    router: DomainRouter,
    meta: Mutex<MetaState>,
    applied: Mutex<HashMap<String, u64>>,
    catalog: Arc<StreamCatalog>,
    engine: Arc<ReplicationEngine>,
    status_tx: watch::Sender<Option<ServerStatus>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Validate `config`, host the metadata group and start the bridges, the replication
    /// engine and the background tasks.
    pub fn start(config: Config, collaborators: Collaborators) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        config.server.log_remote_notices();

        let id = PeerId::new(config.server.server_id.unwrap_or_else(rand::random));
        let server_config = Arc::new(config.server.clone());
        let cluster = server_config.cluster_name();
        let domain = server_config.domain();

        let peers = Arc::new(PeerRegistry::new());
        let mut local = PeerInfo::new(id, server_config.server_name.clone(), cluster.clone())
            .with_domain(domain.clone());
        local.jetstream = server_config.jetstream.enabled;
        peers.upsert(local);
        for peer in collaborators.cluster.iter().filter(|p| p.id != id) {
            peers.upsert(peer.clone());
        }
        let meta_peers: Vec<PeerId> = collaborators
            .cluster
            .iter()
            .filter(|p| p.id != id && p.cluster == cluster)
            .map(|p| p.id)
            .collect();

        let groups = Arc::new(GroupRegistry::new());
        let links = Arc::new(BridgeLinks::new(LinkContext {
            config: Arc::clone(&server_config),
            local_id: id,
            peers: Arc::clone(&peers),
            groups: Arc::clone(&groups),
        }));
        let router = DomainRouter::new(Arc::clone(&server_config), Arc::clone(&peers));

        let origin: Arc<dyn OriginApi> = Arc::new(
            collaborators
                .origins
                .client(&domain.clone().unwrap_or_default()),
        );
        let engine = Arc::new(ReplicationEngine::new(
            config.replication.clone(),
            Arc::clone(&collaborators.catalog),
            origin,
        )?);

        let (committed_tx, committed_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(None);
        let server = Arc::new(Self {
            id,
            config: server_config,
            status_interval: config.status_interval(),
            peers,
            groups,
            network: collaborators.network,
            drivers: Mutex::new(HashMap::new()),
            committed_tx,
            links,
            router,
            meta: Mutex::new(MetaState::new()),
            applied: Mutex::new(HashMap::new()),
            catalog: collaborators.catalog,
            engine,
            status_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        server.host_group(META_GROUP, GroupKind::Meta, meta_peers)?;
        server.engine.start();
        // streams are held in memory, so recovered feeds refill them from their origins
        server.engine.recover(|_| Vec::new())?;
        server.links.start();

        let link_events = server.links.subscribe();
        let mut tasks = server.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(&server).apply_loop(committed_rx)));
        tasks.push(tokio::spawn(Arc::clone(&server).link_loop(link_events)));
        tasks.push(tokio::spawn(Arc::clone(&server).status_loop()));
        drop(tasks);

        info!(
            server = %server.config.server_name,
            id = %id,
            cluster = %cluster,
            domain = ?domain,
            "server started"
        );
        Ok(server)
    }

    fn open_store(&self, group: &str) -> Result<Arc<dyn LogStore>, ServerError> {
        let Some(dir) = &self.config.jetstream.store_dir else {
            return Ok(Arc::new(MemLogStore::new()));
        };
        let name: String = group
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path: PathBuf = dir.join(name);
        Ok(Arc::new(FileLogStore::open(path)?))
    }

    fn host_group(
        &self,
        name: &str,
        kind: GroupKind,
        peers: Vec<PeerId>,
    ) -> Result<Arc<ConsensusGroup>, ServerError> {
        let store = self.open_store(name)?;
        let raft = self.config.consensus.raft_config(self.id, peers);
        let group = Arc::new(ConsensusGroup::new(name, kind, raft, store, Instant::now())?);
        self.groups.insert(Arc::clone(&group))?;

        let inbox = self.network.register(self.id, name);
        let transport: Arc<dyn RaftTransport> = self.network.clone();
        let driver = GroupDriver::spawn(
            Arc::clone(&group),
            transport,
            inbox,
            self.committed_tx.clone(),
        );
        self.drivers.lock().insert(name.to_string(), driver);
        Ok(group)
    }

    async fn drop_group(&self, name: &str) {
        self.network.unregister(self.id, name);
        self.groups.remove(name);
        self.applied.lock().remove(name);
        let driver = self.drivers.lock().remove(name);
        if let Some(driver) = driver {
            driver.shutdown().await;
        }
    }

    async fn apply_loop(self: Arc<Self>, mut committed: mpsc::UnboundedReceiver<Committed>) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = committed.recv() => next,
            };
            let Some(Committed { group, entry }) = next else { break };
            if group != META_GROUP {
                self.applied.lock().insert(group, entry.index.as_u64());
                continue;
            }
            let change = self.meta.lock().apply(&entry);
            match change {
                Some(MetaChange::Assigned(assignment)) => self.on_assigned(assignment),
                Some(MetaChange::Removed(assignment)) => self.on_removed(assignment).await,
                None => {}
            }
        }
        debug!(server = %self.id, "apply loop stopped");
    }

    fn on_assigned(&self, assignment: StreamAssignment) {
        if !assignment.peers.contains(&self.id) {
            debug!(stream = %assignment.name(), "stream assigned elsewhere");
            return;
        }
        let others: Vec<PeerId> = assignment
            .peers
            .iter()
            .copied()
            .filter(|p| *p != self.id)
            .collect();
        let group = assignment.group_name();
        if let Err(e) = self.host_group(&group, GroupKind::Stream, others) {
            warn!(group = %group, error = %e, "failed to host stream group");
            return;
        }
        if assignment.host() == Some(self.id) {
            match self.engine.create_stream(assignment.config.clone()) {
                Ok(_) => {}
                Err(ReplError::StreamExists { .. }) => {
                    debug!(stream = %assignment.name(), "stream already stored")
                }
                Err(e) => warn!(stream = %assignment.name(), error = %e, "failed to create stream"),
            }
        }
        info!(
            stream = %assignment.name(),
            cluster = %assignment.cluster,
            replicas = assignment.peers.len(),
            "stream assigned here"
        );
    }

    async fn on_removed(&self, assignment: StreamAssignment) {
        let group = assignment.group_name();
        if self.groups.contains(&group) {
            self.drop_group(&group).await;
        }
        if assignment.host() == Some(self.id) {
            if let Err(e) = self.engine.delete_stream(assignment.name()).await {
                warn!(stream = %assignment.name(), error = %e, "failed to delete stream");
            }
        }
        info!(stream = %assignment.name(), "stream removed");
    }

    async fn link_loop(self: Arc<Self>, mut events: broadcast::Receiver<LinkEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(LinkEvent::Up { remote, domain, .. }) => {
                    let kicked = self.engine.handle_link_up(domain.as_deref());
                    debug!(remote = %remote, domain = ?domain, feeds = kicked, "bridge up, feeds kicked");
                }
                Ok(LinkEvent::Down { remote, domain, .. }) => {
                    debug!(remote = %remote, domain = ?domain, "bridge down");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "link events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn status_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.status_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            for event in self.peers.take_events() {
                match event {
                    PeerEvent::NameCollision { name, id } => {
                        warn!(name = %name, id = %id, "servers share a display name, keyed by id")
                    }
                    other => debug!(event = ?other, "peer registry changed"),
                }
            }
            self.status_tx.send_replace(Some(self.status()));
        }
    }

    /// Place a stream and assign it through the metadata group. The assignment takes
    /// effect once the entry commits.
    pub fn create_stream(
        &self,
        account: &str,
        cluster: Option<&str>,
        replicas: usize,
        config: StreamConfig,
    ) -> Result<StreamAssignment, ServerError> {
        let placement = self.router.place_stream(account, cluster, replicas)?;
        let meta = self.groups.meta().ok_or(PlacementError::NoMetaLeader)?;
        if meta.leader().is_none() {
            return Err(PlacementError::NoMetaLeader.into());
        }
        let assignment = StreamAssignment {
            account: account.to_string(),
            cluster: placement.cluster,
            domain: placement.domain,
            peers: placement.peers,
            config,
        };
        meta.propose_or_forward(MetaCommand::AssignStream(assignment.clone()).encode()?)?;
        info!(stream = %assignment.name(), peers = ?assignment.peers, "stream assignment proposed");
        Ok(assignment)
    }

    /// Remove a stream everywhere.
    pub fn delete_stream(&self, name: &str) -> Result<(), ServerError> {
        if self.meta.lock().stream(name).is_none() {
            return Err(ReplError::UnknownStream {
                name: name.to_string(),
            }
            .into());
        }
        let meta = self.groups.meta().ok_or(PlacementError::NoMetaLeader)?;
        meta.propose_or_forward(
            MetaCommand::RemoveStream {
                name: name.to_string(),
            }
            .encode()?,
        )?;
        Ok(())
    }

    /// Replicate an opaque entry through a stream's consensus group.
    pub fn replicate(&self, stream: &str, payload: Vec<u8>) -> Result<(), ServerError> {
        let group = self.groups.get(&format!("S:{}", stream))?;
        group.propose_or_forward(GroupOp::Payload(payload))?;
        Ok(())
    }

    /// Server id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Server configuration.
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Known peers.
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    /// Hosted consensus groups.
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Bridge links.
    pub fn links(&self) -> &Arc<BridgeLinks> {
        &self.links
    }

    /// Replication engine.
    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    /// Streams stored in this server's domain.
    pub fn catalog(&self) -> &Arc<StreamCatalog> {
        &self.catalog
    }

    /// Assignment of one stream as applied here.
    pub fn assignment(&self, stream: &str) -> Option<StreamAssignment> {
        self.meta.lock().stream(stream).cloned()
    }

    /// Index of the last entry applied from a hosted group other than the metadata group.
    pub fn applied_index(&self, group: &str) -> Option<u64> {
        self.applied.lock().get(group).copied()
    }

    /// Current status.
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            server_id: self.id,
            server_name: self.config.server_name.clone(),
            domain: self.config.domain(),
            cluster: self.config.cluster_name(),
            meta_leader: self.groups.meta().and_then(|m| m.leader()),
            groups: self.groups.statuses(),
            peers: self.peers.peers().into_iter().map(|p| (p.id, p)).collect(),
            name_collisions: self.peers.name_collisions(),
            remotes: self
                .links
                .remotes()
                .iter()
                .map(|r| RemoteStatus::from_remote(r))
                .collect(),
            replication: self.engine.health(),
            feeds: self.engine.feed_reports(),
            streams: self.catalog.names(),
        }
    }

    /// Status published by the periodic status task.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<ServerStatus>> {
        self.status_tx.subscribe()
    }

    /// Stop bridges, replication, background tasks and group drivers, in that order.
    pub async fn shutdown(&self) {
        info!(server = %self.config.server_name, id = %self.id, "server shutting down");
        self.links.shutdown();
        self.engine.shutdown().await;
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "server task failed");
                }
            }
        }
        let drivers: Vec<(String, GroupDriver)> = self.drivers.lock().drain().collect();
        for (name, driver) in drivers {
            self.network.unregister(self.id, &name);
            driver.shutdown().await;
        }
    }
}
