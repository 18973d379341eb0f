//! Access to origin streams, locally or through a bridge.
//!
//! Requests are addressed by API prefix: `$JS.API` for the local domain and
//! `$JS.<DOMAIN>.API` for a remote one. [`DomainDirectory`] is the in-process stand-in
//! for the deployments on both ends of the bridges, with per-link state so tests can
//! take a bridge down or make it swallow requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::catalog::StreamCatalog;
use crate::error::ReplicationFailure;
use crate::stream::{subject_matches, StoredMessage};

/// API prefix of the local domain.
pub const LOCAL_API_PREFIX: &str = "$JS.API";

/// API prefix reaching `domain`.
pub fn api_prefix(domain: Option<&str>) -> String {
    match domain.filter(|d| !d.is_empty()) {
        Some(domain) => format!("$JS.{}.API", domain),
        None => LOCAL_API_PREFIX.to_string(),
    }
}

/// Domain addressed by an API prefix: `Some(None)` for the local domain.
pub fn parse_api_prefix(prefix: &str) -> Option<Option<String>> {
    if prefix == LOCAL_API_PREFIX {
        return Some(None);
    }
    let domain = prefix.strip_prefix("$JS.")?.strip_suffix(".API")?;
    if domain.is_empty() || domain.contains('.') {
        return None;
    }
    Some(Some(domain.to_string()))
}

/// Ask the origin for an ephemeral consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRequest {
    /// Origin stream
    pub stream: String,
    /// First origin sequence to deliver
    pub deliver_from: u64,
    /// Subject filter
    pub filter_subject: Option<String>,
}

/// A created consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Consumer name
    pub name: String,
    /// Origin stream
    pub stream: String,
    /// First sequence it will deliver
    pub deliver_from: u64,
}

/// Operations a feed needs from its origin.
#[async_trait]
pub trait OriginApi: Send + Sync {
    /// Create an ephemeral consumer delivering from `request.deliver_from`.
    async fn create_consumer(
        &self,
        api_prefix: &str,
        request: ConsumerRequest,
    ) -> Result<ConsumerInfo, ReplicationFailure>;

    /// Pull up to `max` messages from a consumer.
    async fn fetch(
        &self,
        api_prefix: &str,
        stream: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StoredMessage>, ReplicationFailure>;

    /// Delete a consumer.
    async fn delete_consumer(
        &self,
        api_prefix: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<(), ReplicationFailure>;
}

/// State of the bridge between two domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Requests pass
    Up,
    /// Requests fail at once
    Down,
    /// Requests get no answer and time out
    Blackhole,
}

#[derive(Debug, Clone)]
struct ConsumerCursor {
    next_seq: u64,
    filter: Option<String>,
}

type ConsumerKey = (String, String, String);

/// Every deployment reachable in-process, keyed by domain name. The empty name is
/// the deployment without a domain.
pub struct DomainDirectory {
    domains: DashMap<String, Arc<StreamCatalog>>,
    links: Mutex<HashMap<(String, String), LinkState>>,
    denies: Mutex<HashMap<String, Vec<String>>>,
    consumers: Mutex<HashMap<ConsumerKey, ConsumerCursor>>,
    request_timeout: Duration,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl DomainDirectory {
    /// An empty directory. Requests into a blackholed link fail after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            domains: DashMap::new(),
            links: Mutex::new(HashMap::new()),
            denies: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Register the catalog serving `domain`.
    pub fn add_domain(&self, domain: &str, catalog: Arc<StreamCatalog>) {
        self.domains.insert(domain.to_string(), catalog);
    }

    /// Set the state of the bridge between two domains. Links start up.
    pub fn set_link(&self, a: &str, b: &str, state: LinkState) {
        tracing::info!(a = %a, b = %b, state = ?state, "bridge link state changed");
        self.links.lock().insert(link_key(a, b), state);
    }

    /// State of the bridge between two domains.
    pub fn link(&self, a: &str, b: &str) -> LinkState {
        if a == b {
            return LinkState::Up;
        }
        self.links
            .lock()
            .get(&link_key(a, b))
            .copied()
            .unwrap_or(LinkState::Up)
    }

    /// Deny API subjects matching `pattern` for requests leaving `domain`.
    pub fn deny(&self, domain: &str, pattern: &str) {
        self.denies
            .lock()
            .entry(domain.to_string())
            .or_default()
            .push(pattern.to_string());
    }

    /// Consumers currently open on `domain`.
    pub fn consumer_count(&self, domain: &str) -> usize {
        self.consumers
            .lock()
            .keys()
            .filter(|(d, _, _)| d == domain)
            .count()
    }

    /// A client for servers of `local_domain`.
    pub fn client(self: &Arc<Self>, local_domain: &str) -> OriginClient {
        OriginClient {
            directory: Arc::clone(self),
            local_domain: local_domain.to_string(),
        }
    }

    async fn route(
        &self,
        from: &str,
        api_prefix: &str,
        subject: &str,
    ) -> Result<(String, Arc<StreamCatalog>), ReplicationFailure> {
        let target = parse_api_prefix(api_prefix)
            .ok_or_else(|| ReplicationFailure::ConsumerDenied {
                reason: format!("malformed api prefix {}", api_prefix),
            })?
            .unwrap_or_else(|| from.to_string());

        if target != from {
            let denied = self
                .denies
                .lock()
                .get(from)
                .map(|patterns| patterns.iter().any(|p| subject_matches(p, subject)))
                .unwrap_or(false);
            if denied {
                return Err(ReplicationFailure::PermissionDenied {
                    subject: subject.to_string(),
                });
            }
            match self.link(from, &target) {
                LinkState::Up => {}
                LinkState::Down => {
                    return Err(ReplicationFailure::OriginUnreachable { domain: target })
                }
                LinkState::Blackhole => {
                    tokio::time::sleep(self.request_timeout).await;
                    return Err(ReplicationFailure::Timeout);
                }
            }
        }

        match self.domains.get(&target) {
            Some(catalog) => Ok((target, Arc::clone(catalog.value()))),
            None => Err(ReplicationFailure::OriginUnreachable { domain: target }),
        }
    }
}

/// [`OriginApi`] as seen from one domain.
#[derive(Clone)]
pub struct OriginClient {
    directory: Arc<DomainDirectory>,
    local_domain: String,
}

#[async_trait]
impl OriginApi for OriginClient {
    async fn create_consumer(
        &self,
        api_prefix: &str,
        request: ConsumerRequest,
    ) -> Result<ConsumerInfo, ReplicationFailure> {
        let subject = format!("{}.CONSUMER.CREATE.{}", api_prefix, request.stream);
        let (domain, catalog) = self
            .directory
            .route(&self.local_domain, api_prefix, &subject)
            .await?;
        if catalog.get(&request.stream).is_none() {
            return Err(ReplicationFailure::StreamNotFound {
                stream: request.stream,
            });
        }
        let name = uuid::Uuid::new_v4().simple().to_string();
        self.directory.consumers.lock().insert(
            (domain, request.stream.clone(), name.clone()),
            ConsumerCursor {
                next_seq: request.deliver_from.max(1),
                filter: request.filter_subject,
            },
        );
        Ok(ConsumerInfo {
            name,
            stream: request.stream,
            deliver_from: request.deliver_from,
        })
    }

    async fn fetch(
        &self,
        api_prefix: &str,
        stream: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StoredMessage>, ReplicationFailure> {
        let subject = format!("{}.CONSUMER.MSG.NEXT.{}.{}", api_prefix, stream, consumer);
        let (domain, catalog) = self
            .directory
            .route(&self.local_domain, api_prefix, &subject)
            .await?;
        let origin = catalog
            .get(stream)
            .ok_or_else(|| ReplicationFailure::StreamNotFound {
                stream: stream.to_string(),
            })?;
        let mut consumers = self.directory.consumers.lock();
        let key = (domain, stream.to_string(), consumer.to_string());
        let cursor = consumers
            .get_mut(&key)
            .ok_or_else(|| ReplicationFailure::ConsumerNotFound {
                consumer: consumer.to_string(),
            })?;
        let batch = origin.read_from(cursor.next_seq, max, cursor.filter.as_deref());
        if let Some(last) = batch.last() {
            cursor.next_seq = last.seq + 1;
        }
        Ok(batch)
    }

    async fn delete_consumer(
        &self,
        api_prefix: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<(), ReplicationFailure> {
        let subject = format!("{}.CONSUMER.DELETE.{}.{}", api_prefix, stream, consumer);
        let (domain, _) = self
            .directory
            .route(&self.local_domain, api_prefix, &subject)
            .await?;
        let removed = self
            .directory
            .consumers
            .lock()
            .remove(&(domain, stream.to_string(), consumer.to_string()));
        match removed {
            Some(_) => Ok(()),
            None => Err(ReplicationFailure::ConsumerNotFound {
                consumer: consumer.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Stream, StreamConfig};

    fn directory() -> Arc<DomainDirectory> {
        let dir = Arc::new(DomainDirectory::new(Duration::from_secs(2)));
        let hub = Arc::new(StreamCatalog::new());
        let stream = hub
            .insert(Stream::new(StreamConfig::new("ORDERS", &["orders.>"])).unwrap())
            .unwrap();
        for i in 0..5 {
            let subject = if i % 2 == 0 { "orders.eu" } else { "orders.us" };
            stream.publish(subject, format!("m{}", i)).unwrap();
        }
        dir.add_domain("hub", hub);
        dir.add_domain("leaf", Arc::new(StreamCatalog::new()));
        dir
    }

    fn request(from: u64, filter: Option<&str>) -> ConsumerRequest {
        ConsumerRequest {
            stream: "ORDERS".into(),
            deliver_from: from,
            filter_subject: filter.map(String::from),
        }
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(api_prefix(None), "$JS.API");
        assert_eq!(api_prefix(Some("")), "$JS.API");
        assert_eq!(api_prefix(Some("hub")), "$JS.hub.API");
        assert_eq!(parse_api_prefix("$JS.API"), Some(None));
        assert_eq!(parse_api_prefix("$JS.hub.API"), Some(Some("hub".into())));
        assert_eq!(parse_api_prefix("$JS..API"), None);
        assert_eq!(parse_api_prefix("JS.hub"), None);
    }

    #[tokio::test]
    async fn test_remote_consumer_delivers_from_position() {
        let dir = directory();
        let client = dir.client("leaf");
        let info = client
            .create_consumer("$JS.hub.API", request(3, None))
            .await
            .unwrap();
        let batch = client.fetch("$JS.hub.API", "ORDERS", &info.name, 10).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(client
            .fetch("$JS.hub.API", "ORDERS", &info.name, 10)
            .await
            .unwrap()
            .is_empty());

        client.delete_consumer("$JS.hub.API", "ORDERS", &info.name).await.unwrap();
        assert_eq!(dir.consumer_count("hub"), 0);
    }

    #[tokio::test]
    async fn test_filter_applies_at_origin() {
        let dir = directory();
        let client = dir.client("hub");
        let info = client
            .create_consumer(LOCAL_API_PREFIX, request(1, Some("orders.us")))
            .await
            .unwrap();
        let batch = client.fetch(LOCAL_API_PREFIX, "ORDERS", &info.name, 10).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[tokio::test]
    async fn test_link_down_and_missing_stream() {
        let dir = directory();
        let client = dir.client("leaf");
        dir.set_link("hub", "leaf", LinkState::Down);
        assert_eq!(
            client.create_consumer("$JS.hub.API", request(1, None)).await,
            Err(ReplicationFailure::OriginUnreachable { domain: "hub".into() })
        );
        dir.set_link("hub", "leaf", LinkState::Up);
        let mut missing = request(1, None);
        missing.stream = "NOPE".into();
        assert!(matches!(
            client.create_consumer("$JS.hub.API", missing).await,
            Err(ReplicationFailure::StreamNotFound { .. })
        ));
        assert!(matches!(
            client.fetch("$JS.hub.API", "ORDERS", "gone", 1).await,
            Err(ReplicationFailure::ConsumerNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blackhole_times_out() {
        let dir = directory();
        let client = dir.client("leaf");
        dir.set_link("hub", "leaf", LinkState::Blackhole);
        let started = tokio::time::Instant::now();
        assert_eq!(
            client.create_consumer("$JS.hub.API", request(1, None)).await,
            Err(ReplicationFailure::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_denied_api_subject() {
        let dir = directory();
        dir.deny("leaf", "$JS.hub.API.CONSUMER.CREATE.>");
        let client = dir.client("leaf");
        assert!(matches!(
            client.create_consumer("$JS.hub.API", request(1, None)).await,
            Err(ReplicationFailure::PermissionDenied { .. })
        ));
    }
}
