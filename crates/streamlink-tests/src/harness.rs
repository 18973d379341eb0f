//! Test harness: in-process deployments of streamlink servers joined by simulated bridges.
//!
//! Every server of every deployment shares one [`LocalNetwork`] for consensus traffic and
//! one [`DomainDirectory`] for stream APIs. Servers of the same domain share a catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use streamlink_bridge::{
    BridgeError, ClusterConfig, ConsensusTiming, ExtensionDecision, ExtensionHint, RemoteConfig,
    DEFAULT_SYSTEM_ACCOUNT,
};
use streamlink_consensus::{GroupStatus, LocalNetwork, PeerId, PeerInfo, META_GROUP};
use streamlink_repl::{
    BackoffConfig, DomainDirectory, EngineConfig, LinkState, ReplError, StreamCatalog,
};
use streamlink_server::{Collaborators, Config, Server, ServerError};
use tokio::time::Instant;

/// Route logs to the test writer; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Election timing short enough for tests.
pub fn fast_timing() -> ConsensusTiming {
    ConsensusTiming {
        election_timeout_min_ms: 60,
        election_timeout_max_ms: 120,
        heartbeat_interval_ms: 15,
    }
}

/// Replication settings short enough for tests.
pub fn fast_replication() -> EngineConfig {
    EngineConfig {
        health_check_interval_ms: 50,
        stale_threshold_ms: 1000,
        request_timeout_ms: 200,
        idle_poll_ms: 10,
        backoff: BackoffConfig {
            initial_ms: 50,
            max_ms: 2000,
            multiplier: 2.0,
        },
        ..EngineConfig::default()
    }
}

/// Shape of one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    /// Cluster name
    pub cluster: String,
    /// Domain, if any
    pub domain: Option<String>,
    /// Display name and id of each server
    pub servers: Vec<(String, u64)>,
    /// Extension hint of every server
    pub hint: ExtensionHint,
    /// Demote every stream group when a bridge goes away
    pub observer_on_remote_loss: bool,
    /// Give every server one system-account remote
    pub bridged: bool,
}

impl DeploymentSpec {
    /// Servers named `<cluster>-<n>` with the given ids.
    pub fn new(cluster: &str, ids: &[u64]) -> Self {
        Self {
            cluster: cluster.to_string(),
            domain: None,
            servers: ids
                .iter()
                .enumerate()
                .map(|(i, id)| (format!("{}-{}", cluster, i + 1), *id))
                .collect(),
            hint: ExtensionHint::Auto,
            observer_on_remote_loss: false,
            bridged: false,
        }
    }

    /// Set the domain.
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    /// Rename the servers in order.
    pub fn names(mut self, names: &[&str]) -> Self {
        for (server, name) in self.servers.iter_mut().zip(names) {
            server.0 = name.to_string();
        }
        self
    }

    /// Give every server a system-account remote.
    pub fn bridged(mut self) -> Self {
        self.bridged = true;
        self
    }

    /// Demote every local stream group on bridge loss.
    pub fn observer_on_remote_loss(mut self) -> Self {
        self.observer_on_remote_loss = true;
        self
    }

    /// Configuration of the server at `index`.
    pub fn config(&self, index: usize) -> Config {
        let (name, id) = &self.servers[index];
        let mut config = Config::default();
        let server = &mut config.server;
        server.server_name = name.clone();
        server.server_id = Some(*id);
        server.cluster = Some(ClusterConfig {
            name: self.cluster.clone(),
            listen: None,
            routes: self
                .servers
                .iter()
                .filter(|(other, _)| other != name)
                .map(|(other, _)| format!("{}:6222", other))
                .collect(),
        });
        server.jetstream.domain = self.domain.clone();
        server.jetstream.extension_hint = self.hint;
        server.jetstream.observer_on_remote_loss = self.observer_on_remote_loss;
        if self.bridged {
            server.remotes = vec![RemoteConfig::new("nats://hub:7422", DEFAULT_SYSTEM_ACCOUNT)];
        }
        server.consensus = fast_timing();
        config.replication = fast_replication();
        config.status_interval_ms = 50;
        config
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.servers
            .iter()
            .map(|(name, id)| {
                PeerInfo::new(PeerId::new(*id), name.clone(), self.cluster.clone())
                    .with_domain(self.domain.clone())
            })
            .collect()
    }
}

/// Shared plumbing for every deployment of a test.
pub struct TestNet {
    /// Consensus traffic
    pub network: Arc<LocalNetwork>,
    /// Stream APIs by domain
    pub origins: Arc<DomainDirectory>,
    catalogs: Mutex<HashMap<String, Arc<StreamCatalog>>>,
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNet {
    /// An empty network.
    pub fn new() -> Self {
        init_tracing();
        Self {
            network: Arc::new(LocalNetwork::new()),
            origins: Arc::new(DomainDirectory::new(fast_replication().request_timeout())),
            catalogs: Mutex::new(HashMap::new()),
        }
    }

    fn catalog(&self, domain: &str) -> Arc<StreamCatalog> {
        let mut catalogs = self.catalogs.lock();
        let catalog = catalogs
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(StreamCatalog::new()));
        self.origins.add_domain(domain, Arc::clone(catalog));
        Arc::clone(catalog)
    }

    /// Start every server of `spec`. Nothing is awaited, so bridges connected right
    /// after this call see servers that have not run a single timer yet.
    pub fn deploy(&self, spec: DeploymentSpec) -> Result<Deployment, ServerError> {
        let domain = spec.domain.clone().unwrap_or_default();
        let catalog = self.catalog(&domain);
        let cluster = spec.peers();
        let mut servers = Vec::new();
        for index in 0..spec.servers.len() {
            servers.push(Server::start(
                spec.config(index),
                Collaborators {
                    network: Arc::clone(&self.network),
                    origins: Arc::clone(&self.origins),
                    catalog: Arc::clone(&catalog),
                    cluster: cluster.clone(),
                },
            )?);
        }
        Ok(Deployment {
            spec,
            catalog,
            servers,
        })
    }

    /// Bridge each server of `leaf` to a server of `hub`, pairing them by position.
    pub fn bridges(&self, leaf: &Deployment, hub: &Deployment) -> Bridges {
        let links = leaf
            .servers
            .iter()
            .enumerate()
            .map(|(i, server)| Bridge {
                leaf: Arc::clone(server),
                hub: Arc::clone(&hub.servers[i % hub.servers.len()]),
            })
            .collect();
        Bridges {
            network: Arc::clone(&self.network),
            origins: Arc::clone(&self.origins),
            leaf_ids: leaf.ids(),
            hub_ids: hub.ids(),
            leaf_domain: leaf.spec.domain.clone().unwrap_or_default(),
            hub_domain: hub.spec.domain.clone().unwrap_or_default(),
            links,
        }
    }
}

/// The running servers of one deployment.
pub struct Deployment {
    /// How it was built
    pub spec: DeploymentSpec,
    /// Stream storage of its domain
    pub catalog: Arc<StreamCatalog>,
    /// Servers in declaration order
    pub servers: Vec<Arc<Server>>,
}

impl Deployment {
    /// Server ids in declaration order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.servers.iter().map(|s| s.id()).collect()
    }

    /// Server at `index`.
    pub fn server(&self, index: usize) -> &Arc<Server> {
        &self.servers[index]
    }

    /// Server currently leading the metadata group, if it is one of ours.
    pub fn meta_leader(&self) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| {
            s.groups()
                .meta()
                .map(|meta| meta.is_leader())
                .unwrap_or(false)
        })
    }

    /// Status of `group` on every server hosting it.
    pub fn group_statuses(&self, group: &str) -> Vec<GroupStatus> {
        self.servers
            .iter()
            .filter_map(|s| s.groups().get(group).ok().map(|g| g.status()))
            .collect()
    }

    /// Metadata group status on every server.
    pub fn meta_statuses(&self) -> Vec<GroupStatus> {
        self.group_statuses(META_GROUP)
    }

    /// Messages stored in `stream`, zero when absent.
    pub fn count(&self, stream: &str) -> usize {
        self.catalog.get(stream).map(|s| s.len()).unwrap_or(0)
    }

    /// Publish `count` messages to `stream`.
    pub fn publish(&self, stream: &str, subject: &str, count: usize) -> Result<(), ReplError> {
        let stream = self
            .catalog
            .get(stream)
            .ok_or_else(|| ReplError::UnknownStream {
                name: stream.to_string(),
            })?;
        for i in 0..count {
            stream.publish(subject, format!("{}-{}", self.spec.cluster, i))?;
        }
        Ok(())
    }

    /// Stop every server.
    pub async fn shutdown(&self) {
        for server in &self.servers {
            server.shutdown().await;
        }
    }
}

/// One simulated bridge: the leaf server dials the hub server on its first remote.
pub struct Bridge {
    /// Dialing side
    pub leaf: Arc<Server>,
    /// Accepting side
    pub hub: Arc<Server>,
}

impl Bridge {
    /// Deliver the handshake to both sides, accepting side first.
    pub fn connect(&self) -> Result<ExtensionDecision, BridgeError> {
        let account = self
            .leaf
            .config()
            .remotes
            .first()
            .map(|r| r.account.clone())
            .ok_or(BridgeError::UnknownRemote(0))?;
        self.hub
            .links()
            .handle_inbound_connect(&account, self.leaf.links().local_identity());
        self.leaf
            .links()
            .handle_connect(0, self.hub.links().local_identity())
    }

    /// Deliver the loss to both sides.
    pub fn disconnect(&self) -> Result<(), BridgeError> {
        self.leaf.links().handle_disconnect(0)?;
        self.hub.links().handle_inbound_disconnect(self.leaf.id());
        Ok(())
    }
}

/// Every bridge between two deployments, plus the network paths they stand for.
pub struct Bridges {
    network: Arc<LocalNetwork>,
    origins: Arc<DomainDirectory>,
    leaf_ids: Vec<PeerId>,
    hub_ids: Vec<PeerId>,
    leaf_domain: String,
    hub_domain: String,
    /// Individual bridges
    pub links: Vec<Bridge>,
}

impl Bridges {
    /// Heal the paths and connect every bridge back to back, without yielding.
    pub fn connect_all(&self) -> Result<Vec<ExtensionDecision>, BridgeError> {
        self.network.heal(&self.leaf_ids, &self.hub_ids);
        if self.leaf_domain != self.hub_domain {
            self.origins
                .set_link(&self.leaf_domain, &self.hub_domain, LinkState::Up);
        }
        self.links.iter().map(|b| b.connect()).collect()
    }

    /// Cut the paths and disconnect every bridge.
    pub fn disconnect_all(&self) -> Result<(), BridgeError> {
        self.network.partition(&self.leaf_ids, &self.hub_ids);
        if self.leaf_domain != self.hub_domain {
            self.origins
                .set_link(&self.leaf_domain, &self.hub_domain, LinkState::Down);
        }
        for bridge in &self.links {
            bridge.disconnect()?;
        }
        Ok(())
    }
}

/// A three-server hub and a three-server leaf cluster whose servers each dial one hub
/// server over a system-account bridge, merged into one metadata group.
pub struct Extended {
    /// Shared plumbing
    pub net: TestNet,
    /// Accepting side, ids 1 to 3
    pub hub: Deployment,
    /// Dialing side, ids 11 to 13, demoting every stream group on bridge loss
    pub leaf: Deployment,
    /// The three bridges
    pub bridges: Bridges,
}

impl Extended {
    /// Stop both deployments.
    pub async fn shutdown(&self) {
        self.leaf.shutdown().await;
        self.hub.shutdown().await;
    }
}

/// Build an [`Extended`] pair and wait until the metadata group spans all six servers.
/// `leaf_names` renames the leaf servers.
pub async fn extended(leaf_names: Option<&[&str]>) -> Result<Extended, String> {
    let net = TestNet::new();
    let hub = net
        .deploy(DeploymentSpec::new("hub", &[1, 2, 3]))
        .map_err(|e| e.to_string())?;
    wait_for(Duration::from_secs(3), || hub.meta_leader().is_some())
        .await
        .ok_or("hub never elected a metadata leader")?;

    let mut spec = DeploymentSpec::new("leaf", &[11, 12, 13])
        .bridged()
        .observer_on_remote_loss();
    if let Some(names) = leaf_names {
        spec = spec.names(names);
    }
    let leaf = net.deploy(spec).map_err(|e| e.to_string())?;
    let bridges = net.bridges(&leaf, &hub);
    bridges.connect_all().map_err(|e| e.to_string())?;

    let all: Vec<PeerId> = hub.ids().into_iter().chain(leaf.ids()).collect();
    wait_for(Duration::from_secs(5), || {
        hub.meta_leader()
            .or_else(|| leaf.meta_leader())
            .and_then(|s| s.groups().meta())
            .map(|meta| all.iter().all(|id| meta.has_member(*id)))
            .unwrap_or(false)
    })
    .await
    .ok_or("leaf servers never joined the metadata group")?;
    wait_for(Duration::from_secs(3), || {
        hub.servers
            .iter()
            .chain(leaf.servers.iter())
            .all(|s| s.status().meta_leader.is_some())
    })
    .await
    .ok_or("metadata leader not known everywhere")?;
    Ok(Extended {
        net,
        hub,
        leaf,
        bridges,
    })
}

/// Poll `done` every few milliseconds. Returns the time taken, or `None` after `limit`.
pub async fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) -> Option<Duration> {
    let started = Instant::now();
    loop {
        if done() {
            return Some(started.elapsed());
        }
        if started.elapsed() >= limit {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
