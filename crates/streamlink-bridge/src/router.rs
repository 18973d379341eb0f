//! Stream placement across clusters and domains.

use std::sync::Arc;

use serde::Serialize;
use streamlink_consensus::{PeerId, PeerRegistry};

use crate::config::ServerConfig;
use crate::error::PlacementError;

/// Where a new stream goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Target cluster
    pub cluster: String,
    /// Domain of the target cluster, when reached through a redirect
    pub domain: Option<String>,
    /// Chosen replica set, ordered by id
    pub peers: Vec<PeerId>,
}

/// Resolves placement requests against the peer registry.
pub struct DomainRouter {
    config: Arc<ServerConfig>,
    peers: Arc<PeerRegistry>,
}

impl DomainRouter {
    /// Create a router over `peers`.
    pub fn new(config: Arc<ServerConfig>, peers: Arc<PeerRegistry>) -> Self {
        Self { config, peers }
    }

    /// Pick a cluster and replica set for a stream owned by `account`.
    ///
    /// A requested cluster must hold `replicas` eligible peers. Without one the local
    /// cluster is used when the account has streams enabled here, otherwise the
    /// account's default-domain redirect decides.
    pub fn place_stream(
        &self,
        account: &str,
        requested_cluster: Option<&str>,
        replicas: usize,
    ) -> Result<Placement, PlacementError> {
        if replicas == 0 {
            return Err(PlacementError::InvalidReplicas(replicas));
        }

        let (cluster, domain) = match requested_cluster {
            Some(cluster) => (cluster.to_string(), None),
            None => self.default_target(account)?,
        };

        let eligible = self.peers.eligible_in_cluster(&cluster);
        if eligible.len() < replicas {
            tracing::warn!(
                account = %account,
                cluster = %cluster,
                available = eligible.len(),
                required = replicas,
                "stream placement failed"
            );
            return Err(PlacementError::NoSuitablePeers {
                cluster,
                available: eligible.len(),
                required: replicas,
            });
        }

        let peers: Vec<PeerId> = eligible.iter().take(replicas).map(|p| p.id).collect();
        tracing::debug!(account = %account, cluster = %cluster, peers = ?peers, "stream placed");
        Ok(Placement {
            cluster,
            domain,
            peers,
        })
    }

    fn default_target(&self, account: &str) -> Result<(String, Option<String>), PlacementError> {
        if self.config.account_jetstream_enabled(account) {
            return Ok((self.config.cluster_name(), self.config.domain()));
        }
        let redirect = match self.config.default_js_domain.get(account) {
            Some(domain) => domain,
            None => {
                return Err(PlacementError::JetStreamNotEnabled {
                    account: account.to_string(),
                })
            }
        };
        let domain = Some(redirect.clone()).filter(|d| !d.is_empty());
        match self.peers.domain_cluster(domain.as_deref()) {
            Some(cluster) => Ok((cluster, domain)),
            None => Err(PlacementError::UnknownDomain {
                domain: redirect.clone(),
            }),
        }
    }
}
