//! Two bridged domains sharing one in-process directory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use streamlink_repl::{
    DomainDirectory, EngineConfig, LinkState, OriginApi, ReplicationEngine, StreamCatalog,
};
use tokio::time::Instant;

pub const EAST: &str = "east";
pub const WEST: &str = "west";

/// One deployment: its catalog and its engine.
pub struct Site {
    pub domain: &'static str,
    pub catalog: Arc<StreamCatalog>,
    pub engine: Arc<ReplicationEngine>,
}

impl Site {
    pub fn count(&self, stream: &str) -> usize {
        self.catalog.get(stream).map(|s| s.len()).unwrap_or(0)
    }

    pub fn publish(&self, stream: &str, subject: &str, count: usize) {
        let stream = self.catalog.get(stream).unwrap();
        for i in 0..count {
            stream.publish(subject, format!("{}-{}", self.domain, i)).unwrap();
        }
    }
}

pub struct Domains {
    pub directory: Arc<DomainDirectory>,
    pub east: Site,
    pub west: Site,
}

impl Domains {
    pub fn new(config: EngineConfig) -> Self {
        let directory = Arc::new(DomainDirectory::new(Duration::from_secs(2)));
        let east = site(&directory, EAST, config.clone(), None);
        let west = site(&directory, WEST, config, None);
        Self {
            directory,
            east,
            west,
        }
    }

    pub fn set_link(&self, state: LinkState) {
        self.directory.set_link(EAST, WEST, state);
    }

    /// Restore the bridge and deliver the connect event to both sides.
    pub fn restore_link(&self) {
        self.set_link(LinkState::Up);
        self.east.engine.handle_link_up(Some(WEST));
        self.west.engine.handle_link_up(Some(EAST));
    }

    pub async fn shutdown(&self) {
        self.east.engine.shutdown().await;
        self.west.engine.shutdown().await;
    }
}

/// A site in `directory`. `origin` replaces the directory client.
pub fn site(
    directory: &Arc<DomainDirectory>,
    domain: &'static str,
    config: EngineConfig,
    origin: Option<Arc<dyn OriginApi>>,
) -> Site {
    let catalog = Arc::new(StreamCatalog::new());
    directory.add_domain(domain, Arc::clone(&catalog));
    let origin = origin.unwrap_or_else(|| Arc::new(directory.client(domain)));
    let engine =
        Arc::new(ReplicationEngine::new(config, Arc::clone(&catalog), origin).unwrap());
    engine.start();
    Site {
        domain,
        catalog,
        engine,
    }
}

/// Poll `done` until it holds, failing after `limit`.
pub async fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) -> Duration {
    let started = Instant::now();
    while !done() {
        assert!(started.elapsed() < limit, "condition not reached within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    started.elapsed()
}
