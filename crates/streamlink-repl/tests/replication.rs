//! Replication across two bridged domains, with outages and restarts.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{site, wait_for, Domains, EAST, WEST};
use streamlink_repl::{
    ConsumerInfo, ConsumerRequest, DomainDirectory, EngineConfig, FeedHealth, FeedSpec,
    LinkState, OriginApi, OriginClient, ReplicationEngine, ReplicationFailure, StoredMessage,
    StreamCatalog, StreamConfig,
};
use tokio::time::Instant;

fn origin_seqs(messages: &[StoredMessage]) -> BTreeSet<u64> {
    messages
        .iter()
        .filter_map(|m| m.origin.as_ref().map(|o| o.seq))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_bidirectional_mirrors_and_sources_converge_after_outage() {
    let d = Domains::new(EngineConfig::default());
    d.east
        .engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.east.>"]))
        .unwrap();
    d.west
        .engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.west.>"]))
        .unwrap();
    d.east
        .engine
        .create_stream(StreamConfig::mirror(
            "ORDERS_WEST",
            FeedSpec::new("ORDERS").with_domain(WEST),
        ))
        .unwrap();
    d.west
        .engine
        .create_stream(StreamConfig::mirror(
            "ORDERS_EAST",
            FeedSpec::new("ORDERS").with_domain(EAST),
        ))
        .unwrap();
    d.east
        .engine
        .create_stream(StreamConfig::sourced(
            "INBOX",
            vec![FeedSpec::new("ORDERS").with_domain(WEST)],
        ))
        .unwrap();
    d.west
        .engine
        .create_stream(StreamConfig::sourced(
            "INBOX",
            vec![FeedSpec::new("ORDERS").with_domain(EAST)],
        ))
        .unwrap();

    let counts = |d: &Domains| {
        [
            d.east.count("ORDERS_WEST"),
            d.west.count("ORDERS_EAST"),
            d.east.count("INBOX"),
            d.west.count("INBOX"),
        ]
    };

    d.east.publish("ORDERS", "orders.east.new", 500);
    d.west.publish("ORDERS", "orders.west.new", 500);
    wait_for(Duration::from_secs(5), || counts(&d) == [500; 4]).await;

    d.set_link(LinkState::Down);
    d.east.publish("ORDERS", "orders.east.new", 500);
    d.west.publish("ORDERS", "orders.west.new", 500);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(counts(&d), [500; 4]);
    let mirror = d.east.catalog.get("ORDERS_WEST").unwrap();
    assert!(mirror.tracker("ORDERS@west").unwrap().consecutive_failures > 0);

    d.restore_link();
    let took = wait_for(Duration::from_secs(5), || counts(&d) == [1000; 4]).await;
    assert!(took < Duration::from_secs(1));

    let mirrored = mirror.messages();
    assert_eq!(
        mirrored.iter().map(|m| m.seq).collect::<Vec<_>>(),
        (1..=1000).collect::<Vec<_>>()
    );
    let inbox = d.west.catalog.get("INBOX").unwrap().messages();
    assert_eq!(origin_seqs(&inbox), (1..=1000).collect());
    d.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cancels_pending_backoff() {
    let d = Domains::new(EngineConfig::default());
    d.west
        .engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    d.set_link(LinkState::Down);
    let mirror = d
        .east
        .engine
        .create_stream(StreamConfig::mirror(
            "ORDERS_WEST",
            FeedSpec::new("ORDERS").with_domain(WEST),
        ))
        .unwrap();
    let feed = "ORDERS@west";

    wait_for(Duration::from_secs(10), || {
        mirror.tracker(feed).unwrap().consecutive_failures >= 4
    })
    .await;
    let tracker = mirror.tracker(feed).unwrap();
    assert!(matches!(
        tracker.last_error,
        Some(ReplicationFailure::OriginUnreachable { .. })
    ));
    let retry_at = tracker.pending_retry.unwrap();
    assert!(retry_at > Instant::now());

    d.west.publish("ORDERS", "orders.eu", 10);
    d.set_link(LinkState::Up);
    let restored = Instant::now();
    assert_eq!(d.east.engine.handle_link_up(Some(WEST)), 1);
    assert!(mirror.tracker(feed).unwrap().pending_retry.is_none());

    wait_for(Duration::from_secs(1), || mirror.len() == 10).await;
    assert!(Instant::now() < retry_at);
    let tracker = mirror.tracker(feed).unwrap();
    assert_eq!(tracker.consecutive_failures, 0);
    assert!(tracker.last_attempt.unwrap() >= restored);
    d.shutdown().await;
}

/// Origin that redelivers the whole stream on every fetch.
struct ReplayingOrigin {
    catalog: Arc<StreamCatalog>,
    fetches: AtomicUsize,
}

#[async_trait]
impl OriginApi for ReplayingOrigin {
    async fn create_consumer(
        &self,
        _api_prefix: &str,
        request: ConsumerRequest,
    ) -> Result<ConsumerInfo, ReplicationFailure> {
        Ok(ConsumerInfo {
            name: "replay".into(),
            stream: request.stream,
            deliver_from: request.deliver_from,
        })
    }

    async fn fetch(
        &self,
        _api_prefix: &str,
        stream: &str,
        _consumer: &str,
        max: usize,
    ) -> Result<Vec<StoredMessage>, ReplicationFailure> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let origin = self
            .catalog
            .get(stream)
            .ok_or_else(|| ReplicationFailure::StreamNotFound {
                stream: stream.to_string(),
            })?;
        Ok(origin.read_from(1, max, None))
    }

    async fn delete_consumer(
        &self,
        _api_prefix: &str,
        _stream: &str,
        _consumer: &str,
    ) -> Result<(), ReplicationFailure> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_replayed_messages_are_not_duplicated() {
    let catalog = Arc::new(StreamCatalog::new());
    let origin = Arc::new(ReplayingOrigin {
        catalog: Arc::clone(&catalog),
        fetches: AtomicUsize::new(0),
    });
    let engine = ReplicationEngine::new(
        EngineConfig::default(),
        Arc::clone(&catalog),
        origin.clone(),
    )
    .unwrap();

    let orders = engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    for i in 0..100 {
        orders.publish("orders.eu", format!("{}", i)).unwrap();
    }
    let mirror = engine
        .create_stream(StreamConfig::mirror("BACKUP", FeedSpec::new("ORDERS")))
        .unwrap();
    let inbox = engine
        .create_stream(StreamConfig::sourced("INBOX", vec![FeedSpec::new("ORDERS")]))
        .unwrap();

    wait_for(Duration::from_secs(5), || mirror.len() == 100 && inbox.len() == 100).await;
    let fetched = origin.fetches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(origin.fetches.load(Ordering::SeqCst) > fetched + 10);
    assert_eq!(mirror.len(), 100);
    assert_eq!(inbox.len(), 100);

    for i in 0..50 {
        orders.publish("orders.us", format!("{}", i)).unwrap();
    }
    wait_for(Duration::from_secs(5), || mirror.len() == 150 && inbox.len() == 150).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(mirror.len(), 150);
    assert_eq!(origin_seqs(&inbox.messages()).len(), 150);
    engine.shutdown().await;
}

/// Origin whose first fetch never answers.
struct HangingOrigin {
    inner: OriginClient,
    hung: AtomicBool,
    creates: AtomicUsize,
}

#[async_trait]
impl OriginApi for HangingOrigin {
    async fn create_consumer(
        &self,
        api_prefix: &str,
        request: ConsumerRequest,
    ) -> Result<ConsumerInfo, ReplicationFailure> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_consumer(api_prefix, request).await
    }

    async fn fetch(
        &self,
        api_prefix: &str,
        stream: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StoredMessage>, ReplicationFailure> {
        if !self.hung.swap(true, Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.inner.fetch(api_prefix, stream, consumer, max).await
    }

    async fn delete_consumer(
        &self,
        api_prefix: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<(), ReplicationFailure> {
        self.inner.delete_consumer(api_prefix, stream, consumer).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_feed_is_restarted() {
    let directory = Arc::new(DomainDirectory::new(Duration::from_secs(2)));
    let origin = Arc::new(HangingOrigin {
        inner: directory.client(EAST),
        hung: AtomicBool::new(false),
        creates: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        health_check_interval_ms: 200,
        stale_threshold_ms: 1000,
        request_timeout_ms: 60_000,
        ..EngineConfig::default()
    };
    let east = site(&directory, EAST, config, Some(origin.clone()));
    east.engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    east.publish("ORDERS", "orders.eu", 20);
    let started = Instant::now();
    let mirror = east
        .engine
        .create_stream(StreamConfig::mirror("BACKUP", FeedSpec::new("ORDERS")))
        .unwrap();

    wait_for(Duration::from_secs(5), || mirror.len() == 20).await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(origin.creates.load(Ordering::SeqCst), 2);
    let tracker = mirror.tracker("ORDERS").unwrap();
    assert_eq!(tracker.consecutive_failures, 0);
    assert_eq!(tracker.last_applied, 20);

    // the stuck pump released its consumer when it was cancelled
    wait_for(Duration::from_secs(1), || directory.consumer_count(EAST) == 1).await;
    east.engine.shutdown().await;
    assert_eq!(directory.consumer_count(EAST), 0);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_recovery_resumes_from_stored_messages() {
    let dir = tempfile::tempdir().unwrap();
    let durable = EngineConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let directory = Arc::new(DomainDirectory::new(Duration::from_secs(2)));
    let west = site(&directory, WEST, EngineConfig::default(), None);
    west.engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    west.publish("ORDERS", "orders.eu", 30);

    let east = site(&directory, EAST, durable.clone(), None);
    let spec = FeedSpec::new("ORDERS").with_domain(WEST);
    east.engine
        .create_stream(StreamConfig::mirror("BACKUP", spec.clone()))
        .unwrap();
    east.engine
        .create_stream(StreamConfig::sourced("INBOX", vec![spec]))
        .unwrap();
    wait_for(Duration::from_secs(5), || {
        east.count("BACKUP") == 30 && east.count("INBOX") == 30
    })
    .await;
    let stored_backup = east.catalog.get("BACKUP").unwrap().messages();
    east.engine.shutdown().await;
    assert_eq!(directory.consumer_count(WEST), 0);

    west.publish("ORDERS", "orders.eu", 20);

    // BACKUP comes back with its messages, INBOX with an empty store
    let east = site(&directory, EAST, durable, None);
    let restored = east
        .engine
        .recover(|name| match name {
            "BACKUP" => stored_backup.clone(),
            _ => Vec::new(),
        })
        .unwrap();
    assert_eq!(restored.len(), 2);

    wait_for(Duration::from_secs(5), || {
        east.count("BACKUP") == 50 && east.count("INBOX") == 50
    })
    .await;
    let backup = east.catalog.get("BACKUP").unwrap().messages();
    assert_eq!(origin_seqs(&backup), (1..=50).collect());
    // the empty store is refilled from the start, not from the checkpoint
    let inbox = east.catalog.get("INBOX").unwrap().messages();
    assert_eq!(origin_seqs(&inbox), (1..=50).collect());
    east.engine.shutdown().await;
    west.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sources_fail_independently() {
    let d = Domains::new(EngineConfig::default());
    d.west
        .engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    d.east
        .engine
        .create_stream(StreamConfig::new("LOCAL", &["local.>"]))
        .unwrap();
    let inbox = d
        .east
        .engine
        .create_stream(StreamConfig::sourced(
            "INBOX",
            vec![
                FeedSpec::new("ORDERS").with_domain(WEST),
                FeedSpec::new("LOCAL"),
            ],
        ))
        .unwrap();
    d.set_link(LinkState::Down);
    d.west.publish("ORDERS", "orders.eu", 5);
    d.east.publish("LOCAL", "local.eu", 7);

    wait_for(Duration::from_secs(5), || inbox.len() == 7).await;
    let reports = d.east.engine.feed_reports();
    let remote = reports.iter().find(|r| r.feed == "ORDERS@west").unwrap();
    let local = reports.iter().find(|r| r.feed == "LOCAL").unwrap();
    assert!(remote.consecutive_failures > 0);
    assert_ne!(remote.health, FeedHealth::Healthy);
    assert_eq!(local.health, FeedHealth::Healthy);
    assert_eq!(local.applied_total, 7);

    d.restore_link();
    wait_for(Duration::from_secs(2), || inbox.len() == 12).await;
    d.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_denied_bridge_subject_is_reported() {
    let d = Domains::new(EngineConfig::default());
    d.west
        .engine
        .create_stream(StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    d.directory.deny(EAST, "$JS.west.API.CONSUMER.CREATE.>");
    let mirror = d
        .east
        .engine
        .create_stream(StreamConfig::mirror(
            "ORDERS_WEST",
            FeedSpec::new("ORDERS").with_domain(WEST),
        ))
        .unwrap();

    wait_for(Duration::from_secs(5), || {
        mirror
            .tracker("ORDERS@west")
            .map(|t| t.consecutive_failures >= 2)
            .unwrap_or(false)
    })
    .await;
    let report = d
        .east
        .engine
        .feed_reports()
        .into_iter()
        .find(|r| r.stream == "ORDERS_WEST")
        .unwrap();
    assert!(matches!(
        report.last_error,
        Some(ReplicationFailure::PermissionDenied { .. })
    ));
    assert!(report.retry_pending);
    assert!(mirror.is_empty());
    d.shutdown().await;
}
