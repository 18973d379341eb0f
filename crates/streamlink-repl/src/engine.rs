//! The replication engine.
//!
//! Each feed of each stream gets its own pump task: it creates an ephemeral consumer on
//! the origin at `last_applied + 1`, fetches batches and applies them under the stream
//! lock. Failures go through the backoff policy. A health task reschedules feeds that
//! made no attempt within the stale threshold, and a bridge connect event
//! short-circuits pending backoff.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::catalog::StreamCatalog;
use crate::checkpoint::{CheckpointStore, StreamCheckpoint};
use crate::error::{ReplError, ReplicationFailure};
use crate::health::{FeedHealthReport, HealthMonitor, HealthThresholds, ReplicationHealth};
use crate::origin::{ConsumerRequest, OriginApi};
use crate::stream::{StoredMessage, Stream, StreamConfig};
use crate::tracker::{FeedSpec, FeedTracker};

/// Configuration for the replication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Health check period in milliseconds (default: 1s).
    pub health_check_interval_ms: u64,
    /// Time without an attempt after which a feed is rescheduled, in milliseconds (default: 5s).
    pub stale_threshold_ms: u64,
    /// Timeout for a single origin request in milliseconds (default: 2s).
    pub request_timeout_ms: u64,
    /// Maximum messages per fetch (default: 256).
    pub fetch_batch: usize,
    /// Wait after a short batch before polling again, in milliseconds (default: 50ms).
    pub idle_poll_ms: u64,
    /// Consecutive failures before a feed is graded failing (default: 5).
    pub failing_after: u32,
    /// Retry backoff.
    pub backoff: BackoffConfig,
    /// Directory for feed checkpoints; none keeps state in memory only.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 1000,
            stale_threshold_ms: 5000,
            request_timeout_ms: 2000,
            fetch_batch: 256,
            idle_poll_ms: 50,
            failing_after: 5,
            backoff: BackoffConfig::default(),
            checkpoint_dir: None,
        }
    }
}

impl EngineConfig {
    fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    /// Time allowed for one origin API request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            stale_after: Duration::from_millis(self.stale_threshold_ms),
            failing_failures: self.failing_after.max(1),
        }
    }
}

type FeedId = (String, String);

struct FeedTask {
    cancel: CancellationToken,
    kick: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Drives every feed of the streams in one catalog.
pub struct ReplicationEngine {
    config: EngineConfig,
    catalog: Arc<StreamCatalog>,
    origin: Arc<dyn OriginApi>,
    monitor: HealthMonitor,
    checkpoints: Option<CheckpointStore>,
    feeds: Mutex<HashMap<FeedId, FeedTask>>,
    cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// An engine replicating into `catalog` through `origin`.
    pub fn new(
        config: EngineConfig,
        catalog: Arc<StreamCatalog>,
        origin: Arc<dyn OriginApi>,
    ) -> Result<Self, ReplError> {
        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => Some(CheckpointStore::open(dir.clone())?),
            None => None,
        };
        Ok(Self {
            monitor: HealthMonitor::new(config.thresholds()),
            config,
            catalog,
            origin,
            checkpoints,
            feeds: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            health_task: Mutex::new(None),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Streams hosted by this engine's deployment.
    pub fn catalog(&self) -> &Arc<StreamCatalog> {
        &self.catalog
    }

    /// Start the health monitor task.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.health_check_interval();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(engine) = weak.upgrade() else { break };
                engine.check_health(Instant::now());
            }
        });
        if let Some(old) = self.health_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Create a stream and start its feeds.
    pub fn create_stream(&self, config: StreamConfig) -> Result<Arc<Stream>, ReplError> {
        self.install(Stream::new(config)?)
    }

    /// Re-create a stream from the messages it already stores. Feeds resume after the
    /// last origin sequence among them; the saved checkpoint restores failure state.
    pub fn restore_stream(
        &self,
        config: StreamConfig,
        messages: Vec<StoredMessage>,
    ) -> Result<Arc<Stream>, ReplError> {
        let stream = Stream::restore(config, messages)?;
        if let Some(store) = &self.checkpoints {
            if let Some(checkpoint) = store.load(stream.name())? {
                checkpoint.apply_to(&stream);
            }
        }
        self.install(stream)
    }

    /// Restore every checkpointed stream. `stored` returns the messages a stream still
    /// holds in storage; a feed with nothing stored replays its origin from the start.
    pub fn recover(
        &self,
        mut stored: impl FnMut(&str) -> Vec<StoredMessage>,
    ) -> Result<Vec<Arc<Stream>>, ReplError> {
        let Some(store) = &self.checkpoints else {
            return Ok(Vec::new());
        };
        let mut restored = Vec::new();
        for checkpoint in store.load_all()? {
            let messages = stored(checkpoint.stream());
            let stream = Stream::restore(checkpoint.config.clone(), messages)?;
            checkpoint.apply_to(&stream);
            restored.push(self.install(stream)?);
        }
        info!(streams = restored.len(), "replication state recovered");
        Ok(restored)
    }

    fn install(&self, stream: Stream) -> Result<Arc<Stream>, ReplError> {
        if self.cancel.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        let stream = self.catalog.insert(stream)?;
        let feeds: Vec<String> = stream.trackers().iter().map(|t| t.key()).collect();
        for feed in &feeds {
            self.spawn_feed(&stream, feed.clone());
        }
        if !feeds.is_empty() {
            self.save_checkpoint(&stream);
        }
        info!(stream = %stream.name(), feeds = feeds.len(), mirror = stream.is_mirror(), "stream created");
        Ok(stream)
    }

    /// Delete a stream. Its feeds stop and their consumers are deleted before this returns.
    pub async fn delete_stream(&self, name: &str) -> Result<(), ReplError> {
        let stream = self
            .catalog
            .remove(name)
            .ok_or_else(|| ReplError::UnknownStream {
                name: name.to_string(),
            })?;
        let stopped = self.stop_feeds(|(s, _)| s == name).await;
        if let Some(store) = &self.checkpoints {
            store.remove(name)?;
        }
        info!(stream = %name, feeds = stopped, messages = stream.len(), "stream deleted");
        Ok(())
    }

    /// Add a source to an existing stream and start replicating it.
    pub fn add_source(&self, stream: &str, spec: FeedSpec) -> Result<String, ReplError> {
        if self.cancel.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        let target = self.stream(stream)?;
        let key = target.add_feed(spec, 0)?;
        self.spawn_feed(&target, key.clone());
        self.save_checkpoint(&target);
        info!(stream = %stream, feed = %key, "source added");
        Ok(key)
    }

    /// Remove a source. Its pump stops and its consumer is deleted before this returns.
    pub async fn remove_source(&self, stream: &str, feed: &str) -> Result<(), ReplError> {
        let target = self.stream(stream)?;
        self.stop_feeds(|(s, f)| s == stream && f == feed).await;
        target
            .remove_feed(feed)
            .ok_or_else(|| ReplError::UnknownFeed {
                stream: stream.to_string(),
                feed: feed.to_string(),
            })?;
        self.save_checkpoint(&target);
        info!(stream = %stream, feed = %feed, "source removed");
        Ok(())
    }

    fn stream(&self, name: &str) -> Result<Arc<Stream>, ReplError> {
        self.catalog.get(name).ok_or_else(|| ReplError::UnknownStream {
            name: name.to_string(),
        })
    }

    /// A bridge to `domain` came up. Feeds that depend on it (same domain, or any
    /// external feed that is failing) drop their pending backoff and retry now.
    /// Returns the number of feeds retried.
    pub fn handle_link_up(&self, domain: Option<&str>) -> usize {
        let domain = domain.filter(|d| !d.is_empty());
        let mut retried = 0;
        for stream in self.catalog.streams() {
            for tracker in stream.trackers() {
                let spec = &tracker.spec;
                let same_domain = domain.is_some() && spec.domain.as_deref() == domain;
                if !same_domain && !(spec.is_external() && !tracker.is_healthy()) {
                    continue;
                }
                let key = tracker.key();
                let had_retry = stream.with_tracker(&key, |t| t.clear_retry()).unwrap_or(false);
                if tracker.in_flight_since.is_some() && !tracker.is_healthy() {
                    self.restart_feed(&stream, &key, None);
                } else {
                    self.kick_feed(&stream, &key);
                }
                debug!(stream = %stream.name(), feed = %key, had_retry, "feed retried on link up");
                retried += 1;
            }
        }
        if retried > 0 {
            info!(domain = ?domain, feeds = retried, "link up, retrying dependent feeds");
        }
        retried
    }

    /// Reschedule every feed that made no attempt within the stale threshold. A feed
    /// stuck in a request is restarted; a feed waiting out its backoff retries now.
    /// Returns the rescheduled `(stream, feed)` pairs.
    pub fn check_health(&self, now: Instant) -> Vec<(String, String)> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let mut rescheduled = Vec::new();
        for stream in self.catalog.streams() {
            for feed in self.monitor.stale_feeds(&stream, now) {
                let hung = stream
                    .tracker(&feed)
                    .map(|t| t.in_flight_since.is_some())
                    .unwrap_or(false);
                if hung {
                    warn!(stream = %stream.name(), feed = %feed, "feed stalled, restarting");
                    self.restart_feed(&stream, &feed, Some(ReplicationFailure::Stalled));
                } else {
                    let cleared = stream.with_tracker(&feed, |t| t.clear_retry()).unwrap_or(false);
                    if !cleared {
                        continue;
                    }
                    info!(stream = %stream.name(), feed = %feed, "feed stale in backoff, retrying now");
                    self.kick_feed(&stream, &feed);
                }
                rescheduled.push((stream.name().to_string(), feed));
            }
        }
        rescheduled
    }

    fn kick_feed(&self, stream: &Arc<Stream>, feed: &str) {
        if let Some(task) = self
            .feeds
            .lock()
            .get(&(stream.name().to_string(), feed.to_string()))
        {
            task.kick.notify_one();
        }
    }

    fn restart_feed(&self, stream: &Arc<Stream>, feed: &str, failure: Option<ReplicationFailure>) {
        // the old pump must see its cancellation before the tracker is reset
        let old = self
            .feeds
            .lock()
            .remove(&(stream.name().to_string(), feed.to_string()));
        if let Some(old) = old {
            old.cancel.cancel();
        }
        let reset = stream.with_tracker(feed, |t| {
            if let Some(failure) = failure {
                t.consecutive_failures = t.consecutive_failures.saturating_add(1);
                t.last_error = Some(failure);
            }
            t.in_flight_since = None;
            t.pending_retry = None;
            t.pending_consumer_request = false;
            t.consumer = None;
        });
        match reset {
            Ok(()) => self.spawn_feed(stream, feed.to_string()),
            Err(e) => debug!(stream = %stream.name(), feed = %feed, error = %e, "feed gone, not restarted"),
        }
    }

    fn spawn_feed(&self, stream: &Arc<Stream>, feed: String) {
        let cancel = self.cancel.child_token();
        let kick = Arc::new(Notify::new());
        let pump = FeedPump {
            stream: Arc::clone(stream),
            feed: feed.clone(),
            origin: Arc::clone(&self.origin),
            config: self.config.clone(),
            checkpoints: self.checkpoints.clone(),
            cancel: cancel.clone(),
            kick: Arc::clone(&kick),
        };
        let handle = tokio::spawn(pump.run());
        let previous = self.feeds.lock().insert(
            (stream.name().to_string(), feed),
            FeedTask {
                cancel,
                kick,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    async fn stop_feeds(&self, mut select: impl FnMut(&FeedId) -> bool) -> usize {
        let tasks: Vec<FeedTask> = {
            let mut feeds = self.feeds.lock();
            let ids: Vec<FeedId> = feeds.keys().filter(|id| select(id)).cloned().collect();
            ids.iter().filter_map(|id| feeds.remove(id)).collect()
        };
        for task in &tasks {
            task.cancel.cancel();
        }
        let stopped = tasks.len();
        for task in tasks {
            let _ = task.handle.await;
        }
        stopped
    }

    fn save_checkpoint(&self, stream: &Stream) {
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.save(&StreamCheckpoint::capture(stream)) {
                warn!(stream = %stream.name(), error = %e, "checkpoint save failed");
            }
        }
    }

    /// Diagnostics for every feed, ordered by stream then feed.
    pub fn feed_reports(&self) -> Vec<FeedHealthReport> {
        let now = Instant::now();
        let mut reports: Vec<FeedHealthReport> = self
            .catalog
            .streams()
            .iter()
            .flat_map(|stream| {
                stream
                    .trackers()
                    .iter()
                    .map(|t| self.monitor.report(stream.name(), t, now))
                    .collect::<Vec<_>>()
            })
            .collect();
        reports.sort_by(|a, b| (&a.stream, &a.feed).cmp(&(&b.stream, &b.feed)));
        reports
    }

    /// Overall replication status.
    pub fn health(&self) -> ReplicationHealth {
        HealthMonitor::overall(&self.feed_reports())
    }

    /// Number of running pumps.
    pub fn active_feeds(&self) -> usize {
        self.feeds.lock().len()
    }

    /// Stop every task, delete every consumer and save final checkpoints.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let health = self.health_task.lock().take();
        if let Some(health) = health {
            let _ = health.await;
        }
        let stopped = self.stop_feeds(|_| true).await;
        for stream in self.catalog.streams() {
            if !stream.trackers().is_empty() {
                self.save_checkpoint(&stream);
            }
        }
        info!(feeds = stopped, "replication engine stopped");
    }
}

/// The task replicating one feed.
struct FeedPump {
    stream: Arc<Stream>,
    feed: String,
    origin: Arc<dyn OriginApi>,
    config: EngineConfig,
    checkpoints: Option<CheckpointStore>,
    cancel: CancellationToken,
    kick: Arc<Notify>,
}

impl FeedPump {
    async fn run(self) {
        let Some(spec) = self.stream.tracker(&self.feed).map(|t| t.spec) else {
            return;
        };
        let prefix = spec.prefix();
        let mut consumer: Option<String> = None;
        debug!(stream = %self.stream.name(), feed = %self.feed, prefix = %prefix, "feed pump started");

        loop {
            if !self.wait_turn().await {
                break;
            }
            let now = Instant::now();
            if self.update(|t| t.begin_attempt(now)).is_none() {
                break;
            }

            let name = match &consumer {
                Some(name) => name.clone(),
                None => {
                    let Some(deliver_from) = self.update(|t| {
                        t.pending_consumer_request = true;
                        t.last_applied + 1
                    }) else {
                        break;
                    };
                    let request = ConsumerRequest {
                        stream: spec.origin.clone(),
                        deliver_from,
                        filter_subject: spec.filter_subject.clone(),
                    };
                    match self.call(self.origin.create_consumer(&prefix, request)).await {
                        None => break,
                        Some(Ok(info)) => {
                            debug!(
                                stream = %self.stream.name(),
                                feed = %self.feed,
                                consumer = %info.name,
                                deliver_from,
                                "consumer created"
                            );
                            consumer = Some(info.name.clone());
                            let recorded = self.update(|t| {
                                t.consumer = Some(info.name.clone());
                                t.pending_consumer_request = false;
                            });
                            if recorded.is_none() {
                                break;
                            }
                            info.name
                        }
                        Some(Err(failure)) => {
                            if !self.fail(failure) {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let fetched = self
                .call(
                    self.origin
                        .fetch(&prefix, &spec.origin, &name, self.config.fetch_batch),
                )
                .await;
            match fetched {
                None => break,
                Some(Ok(batch)) => {
                    let Ok(outcome) = self.stream.apply_feed(&self.feed, &batch) else {
                        break;
                    };
                    if self.update(|t| t.record_success()).is_none() {
                        break;
                    }
                    if outcome.applied > 0 {
                        debug!(
                            stream = %self.stream.name(),
                            feed = %self.feed,
                            applied = outcome.applied,
                            skipped = outcome.skipped,
                            last_applied = outcome.last_applied,
                            "batch applied"
                        );
                        self.save_checkpoint();
                    }
                    if batch.len() < self.config.fetch_batch && !self.idle().await {
                        break;
                    }
                }
                Some(Err(failure)) => {
                    let reset = failure.resets_consumer();
                    if reset {
                        consumer = None;
                    }
                    let recorded = self.update(|t| {
                        if reset {
                            t.consumer = None;
                        }
                    });
                    if recorded.is_none() || !self.fail(failure) {
                        break;
                    }
                }
            }
        }

        if let Some(name) = consumer {
            self.release(&prefix, &spec.origin, &name).await;
        }
        debug!(stream = %self.stream.name(), feed = %self.feed, "feed pump stopped");
    }

    /// Wait out any scheduled retry. Returns false once cancelled.
    async fn wait_turn(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let retry_at = match self.stream.tracker(&self.feed) {
            Some(tracker) => tracker.pending_retry,
            None => return false,
        };
        let Some(retry_at) = retry_at else {
            return true;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(retry_at) => true,
            _ = self.kick.notified() => true,
        }
    }

    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.idle_poll()) => true,
            _ = self.kick.notified() => true,
        }
    }

    /// Run one origin request under the request timeout. `None` means cancelled.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ReplicationFailure>>,
    ) -> Option<Result<T, ReplicationFailure>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.config.request_timeout(), request) => {
                Some(result.unwrap_or(Err(ReplicationFailure::Timeout)))
            }
        }
    }

    /// Apply `f` to this feed's tracker while the pump is still current. The cancel
    /// check runs under the tracker lock, so a replaced pump never writes over the
    /// state of its successor. `None` means the pump should stop.
    fn update<R>(&self, f: impl FnOnce(&mut FeedTracker) -> R) -> Option<R> {
        let cancel = &self.cancel;
        match self
            .stream
            .with_tracker(&self.feed, |t| (!cancel.is_cancelled()).then(|| f(t)))
        {
            Ok(result) => result,
            Err(e) => {
                debug!(stream = %self.stream.name(), feed = %self.feed, error = %e, "feed removed");
                None
            }
        }
    }

    /// Record a failed attempt and schedule the retry. Returns false if the pump
    /// should stop instead.
    fn fail(&self, failure: ReplicationFailure) -> bool {
        let backoff = self.config.backoff;
        let now = Instant::now();
        let scheduled = self.update(|t| {
            let delay = backoff.delay(t.consecutive_failures.saturating_add(1));
            t.record_failure(failure.clone(), now + delay);
            (t.consecutive_failures, delay)
        });
        let Some((failures, delay)) = scheduled else {
            return false;
        };
        warn!(
            stream = %self.stream.name(),
            feed = %self.feed,
            failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %failure,
            "feed attempt failed"
        );
        true
    }

    async fn release(&self, prefix: &str, origin: &str, consumer: &str) {
        let deleted = tokio::time::timeout(
            self.config.request_timeout(),
            self.origin.delete_consumer(prefix, origin, consumer),
        )
        .await;
        match deleted {
            Ok(Ok(())) => debug!(feed = %self.feed, consumer = %consumer, "consumer deleted"),
            Ok(Err(e)) => debug!(feed = %self.feed, consumer = %consumer, error = %e, "consumer delete failed"),
            Err(_) => debug!(feed = %self.feed, consumer = %consumer, "consumer delete timed out"),
        }
    }

    fn save_checkpoint(&self) {
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.save(&StreamCheckpoint::capture(&self.stream)) {
                warn!(stream = %self.stream.name(), error = %e, "checkpoint save failed");
            }
        }
    }
}
