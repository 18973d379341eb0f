//! Replicated streams: the ordered message log plus the feed trackers that fill it.
//!
//! Each stream guards its log and trackers with one lock, so applying a batch from a
//! feed and advancing that feed's position happen together.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ReplError;
use crate::tracker::{FeedSpec, FeedTracker};

/// Whether `subject` matches `filter`. `*` matches one token, a trailing `>` matches
/// one or more remaining tokens.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(s)) if !s.is_empty() => {}
            (Some(f), Some(s)) if f == s && !s.is_empty() => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Where a replicated message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRef {
    /// Feed key within the destination
    pub feed: String,
    /// Sequence in the origin stream
    pub seq: u64,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Sequence in the stream holding it
    pub seq: u64,
    /// Subject
    pub subject: String,
    /// Payload
    pub payload: Bytes,
    /// Origin reference for replicated messages
    pub origin: Option<OriginRef>,
}

/// Stream definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name
    pub name: String,
    /// Subjects accepted by direct publishes
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Origin mirrored one to one
    #[serde(default)]
    pub mirror: Option<FeedSpec>,
    /// Origins aggregated into this stream
    #[serde(default)]
    pub sources: Vec<FeedSpec>,
}

impl StreamConfig {
    /// A plain stream bound to `subjects`.
    pub fn new(name: impl Into<String>, subjects: &[&str]) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            mirror: None,
            sources: Vec::new(),
        }
    }

    /// A mirror of `origin`.
    pub fn mirror(name: impl Into<String>, origin: FeedSpec) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            mirror: Some(origin),
            sources: Vec::new(),
        }
    }

    /// A stream aggregating `sources`.
    pub fn sourced(name: impl Into<String>, sources: Vec<FeedSpec>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            mirror: None,
            sources,
        }
    }

    /// Every feed of the stream.
    pub fn feeds(&self) -> Vec<FeedSpec> {
        self.mirror.iter().chain(self.sources.iter()).cloned().collect()
    }

    fn validate(&self) -> Result<(), ReplError> {
        let invalid = |msg: &str| ReplError::InvalidConfig {
            stream: self.name.clone(),
            msg: msg.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("empty name"));
        }
        if self.mirror.is_some() && !self.sources.is_empty() {
            return Err(invalid("a mirror cannot also have sources"));
        }
        if self.mirror.is_some() && !self.subjects.is_empty() {
            return Err(invalid("a mirror cannot bind subjects"));
        }
        let mut keys: Vec<String> = self.sources.iter().map(|s| s.key()).collect();
        keys.sort();
        keys.dedup();
        if keys.len() != self.sources.len() {
            return Err(invalid("duplicate source"));
        }
        Ok(())
    }
}

/// Ordered message storage keyed by sequence.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
}

impl MessageLog {
    /// Highest sequence ever stored.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Store at the next sequence.
    pub fn append(&mut self, subject: String, payload: Bytes, origin: Option<OriginRef>) -> u64 {
        self.last_seq += 1;
        let seq = self.last_seq;
        self.messages.insert(
            seq,
            StoredMessage {
                seq,
                subject,
                payload,
                origin,
            },
        );
        seq
    }

    /// Store at the message's own sequence, which must be past the end.
    pub fn insert_at(&mut self, message: StoredMessage) -> bool {
        if message.seq <= self.last_seq {
            return false;
        }
        self.last_seq = message.seq;
        self.messages.insert(message.seq, message);
        true
    }

    /// Message at `seq`.
    pub fn get(&self, seq: u64) -> Option<&StoredMessage> {
        self.messages.get(&seq)
    }

    /// Up to `max` messages at or after `from` whose subject matches `filter`.
    pub fn read_from(&self, from: u64, max: usize, filter: Option<&str>) -> Vec<StoredMessage> {
        self.messages
            .range(from..)
            .map(|(_, m)| m)
            .filter(|m| filter.map(|f| subject_matches(f, &m.subject)).unwrap_or(true))
            .take(max)
            .cloned()
            .collect()
    }

    /// Latest origin sequence stored through `feed`.
    pub fn last_origin_seq(&self, feed: &str) -> Option<u64> {
        self.messages
            .values()
            .rev()
            .filter_map(|m| m.origin.as_ref())
            .find(|o| o.feed == feed)
            .map(|o| o.seq)
    }
}

/// Counts from applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Newly stored messages
    pub applied: usize,
    /// Messages at or below the feed position, ignored
    pub skipped: usize,
    /// Feed position afterwards
    pub last_applied: u64,
}

struct StreamInner {
    log: MessageLog,
    trackers: BTreeMap<String, FeedTracker>,
}

/// One stream.
pub struct Stream {
    config: StreamConfig,
    inner: Mutex<StreamInner>,
}

impl Stream {
    /// An empty stream.
    pub fn new(config: StreamConfig) -> Result<Self, ReplError> {
        Self::restore(config, Vec::new())
    }

    /// A stream holding previously stored messages. Feeds resume after the last
    /// origin sequence stored through them.
    pub fn restore(config: StreamConfig, messages: Vec<StoredMessage>) -> Result<Self, ReplError> {
        config.validate()?;
        let mut log = MessageLog::default();
        for message in messages {
            log.insert_at(message);
        }
        let trackers = config
            .feeds()
            .into_iter()
            .map(|spec| {
                let key = spec.key();
                let last = log.last_origin_seq(&key).unwrap_or(0);
                (key, FeedTracker::new(spec, last))
            })
            .collect();
        Ok(Self {
            config,
            inner: Mutex::new(StreamInner { log, trackers }),
        })
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Definition the stream was created with.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Whether the stream mirrors an origin.
    pub fn is_mirror(&self) -> bool {
        self.config.mirror.is_some()
    }

    /// Publish directly. Mirrors refuse; other streams require a bound subject.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<u64, ReplError> {
        if self.is_mirror() {
            return Err(ReplError::MirrorPublish {
                stream: self.config.name.clone(),
            });
        }
        if !self.config.subjects.iter().any(|f| subject_matches(f, subject)) {
            return Err(ReplError::SubjectMismatch {
                stream: self.config.name.clone(),
                subject: subject.to_string(),
            });
        }
        Ok(self
            .inner
            .lock()
            .log
            .append(subject.to_string(), payload.into(), None))
    }

    /// Apply a batch delivered by a feed. Anything at or below the feed position is
    /// skipped, so redelivery never duplicates.
    pub fn apply_feed(&self, feed: &str, batch: &[StoredMessage]) -> Result<ApplyOutcome, ReplError> {
        let mirror = self.is_mirror();
        let mut inner = self.inner.lock();
        let StreamInner { log, trackers } = &mut *inner;
        let tracker = trackers.get_mut(feed).ok_or_else(|| ReplError::UnknownFeed {
            stream: self.config.name.clone(),
            feed: feed.to_string(),
        })?;

        let mut outcome = ApplyOutcome::default();
        for message in batch {
            if message.seq <= tracker.last_applied {
                outcome.skipped += 1;
                continue;
            }
            let origin = Some(OriginRef {
                feed: feed.to_string(),
                seq: message.seq,
            });
            let matches = tracker
                .spec
                .filter_subject
                .as_deref()
                .map(|f| subject_matches(f, &message.subject))
                .unwrap_or(true);
            if mirror {
                if matches
                    && log.insert_at(StoredMessage {
                        origin,
                        ..message.clone()
                    })
                {
                    outcome.applied += 1;
                }
            } else if matches {
                log.append(message.subject.clone(), message.payload.clone(), origin);
                outcome.applied += 1;
            }
            tracker.last_applied = message.seq;
        }
        tracker.applied_total += outcome.applied as u64;
        outcome.last_applied = tracker.last_applied;
        Ok(outcome)
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest sequence stored.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().log.last_seq()
    }

    /// Up to `max` messages from `from` on, optionally filtered.
    pub fn read_from(&self, from: u64, max: usize, filter: Option<&str>) -> Vec<StoredMessage> {
        self.inner.lock().log.read_from(from, max, filter)
    }

    /// Every stored message, in order.
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.read_from(0, usize::MAX, None)
    }

    /// Latest origin sequence stored through `feed`.
    pub fn last_origin_seq(&self, feed: &str) -> Option<u64> {
        self.inner.lock().log.last_origin_seq(feed)
    }

    /// Snapshot of one tracker.
    pub fn tracker(&self, feed: &str) -> Option<FeedTracker> {
        self.inner.lock().trackers.get(feed).cloned()
    }

    /// Snapshot of every tracker.
    pub fn trackers(&self) -> Vec<FeedTracker> {
        self.inner.lock().trackers.values().cloned().collect()
    }

    /// Run `f` on a tracker under the stream lock.
    pub fn with_tracker<R>(
        &self,
        feed: &str,
        f: impl FnOnce(&mut FeedTracker) -> R,
    ) -> Result<R, ReplError> {
        let mut inner = self.inner.lock();
        match inner.trackers.get_mut(feed) {
            Some(tracker) => Ok(f(tracker)),
            None => Err(ReplError::UnknownFeed {
                stream: self.config.name.clone(),
                feed: feed.to_string(),
            }),
        }
    }

    /// Start tracking an additional source.
    pub fn add_feed(&self, spec: FeedSpec, last_applied: u64) -> Result<String, ReplError> {
        if self.is_mirror() {
            return Err(ReplError::InvalidConfig {
                stream: self.config.name.clone(),
                msg: "a mirror cannot also have sources".into(),
            });
        }
        let key = spec.key();
        let mut inner = self.inner.lock();
        if inner.trackers.contains_key(&key) {
            return Err(ReplError::InvalidConfig {
                stream: self.config.name.clone(),
                msg: format!("duplicate source {}", key),
            });
        }
        let resume = inner.log.last_origin_seq(&key).unwrap_or(0).max(last_applied);
        inner.trackers.insert(key.clone(), FeedTracker::new(spec, resume));
        Ok(key)
    }

    /// Stop tracking a feed.
    pub fn remove_feed(&self, feed: &str) -> Option<FeedTracker> {
        self.inner.lock().trackers.remove(feed)
    }
}
