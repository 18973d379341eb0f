//! Per-feed replication bookkeeping.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ReplicationFailure;
use crate::origin::api_prefix;

/// One origin a stream replicates from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedSpec {
    /// Origin stream name
    pub origin: String,
    /// Only subjects matching this filter are replicated
    #[serde(default)]
    pub filter_subject: Option<String>,
    /// Domain hosting the origin; `None` for the local domain
    #[serde(default)]
    pub domain: Option<String>,
    /// Explicit API prefix, overriding the one derived from the domain
    #[serde(default)]
    pub api_prefix: Option<String>,
}

impl FeedSpec {
    /// A feed from a local origin.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            filter_subject: None,
            domain: None,
            api_prefix: None,
        }
    }

    /// Reach the origin in another domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into()).filter(|d| !d.is_empty());
        self
    }

    /// Replicate only matching subjects.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }

    /// Stable identifier of the feed within its destination stream.
    pub fn key(&self) -> String {
        let mut key = self.origin.clone();
        if let Some(domain) = &self.domain {
            key.push('@');
            key.push_str(domain);
        }
        if let Some(filter) = &self.filter_subject {
            key.push(':');
            key.push_str(filter);
        }
        key
    }

    /// API prefix used to reach the origin.
    pub fn prefix(&self) -> String {
        self.api_prefix
            .clone()
            .unwrap_or_else(|| api_prefix(self.domain.as_deref()))
    }

    /// Whether the origin lives behind a bridge.
    pub fn is_external(&self) -> bool {
        self.domain.is_some() || self.api_prefix.is_some()
    }
}

/// Progress and failure state of one feed.
#[derive(Debug, Clone)]
pub struct FeedTracker {
    /// Feed identity
    pub spec: FeedSpec,
    /// Highest origin sequence applied to the destination
    pub last_applied: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Start of the latest attempt
    pub last_attempt: Option<Instant>,
    /// Most recent failure
    pub last_error: Option<ReplicationFailure>,
    /// Consumer currently delivering to this feed
    pub consumer: Option<String>,
    /// A consumer create request is outstanding
    pub pending_consumer_request: bool,
    /// When the next attempt is due, if one is scheduled
    pub pending_retry: Option<Instant>,
    /// Start of the request currently in flight
    pub in_flight_since: Option<Instant>,
    /// Messages stored through this feed since start
    pub applied_total: u64,
}

impl FeedTracker {
    /// A fresh tracker resuming after `last_applied`.
    pub fn new(spec: FeedSpec, last_applied: u64) -> Self {
        Self {
            spec,
            last_applied,
            consecutive_failures: 0,
            last_attempt: None,
            last_error: None,
            consumer: None,
            pending_consumer_request: false,
            pending_retry: None,
            in_flight_since: None,
            applied_total: 0,
        }
    }

    /// Key of the tracked feed.
    pub fn key(&self) -> String {
        self.spec.key()
    }

    /// An attempt started.
    pub fn begin_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
        self.in_flight_since = Some(now);
        self.pending_retry = None;
    }

    /// The in-flight attempt succeeded.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_error = None;
        self.in_flight_since = None;
        self.pending_consumer_request = false;
    }

    /// The in-flight attempt failed; the next one is due at `retry_at`.
    pub fn record_failure(&mut self, failure: ReplicationFailure, retry_at: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(failure);
        self.in_flight_since = None;
        self.pending_consumer_request = false;
        self.pending_retry = Some(retry_at);
    }

    /// Drop any scheduled retry. Returns true if one was pending.
    pub fn clear_retry(&mut self) -> bool {
        self.pending_retry.take().is_some()
    }

    /// No failure since the last success.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }

    /// Whether the feed has made no attempt since `deadline`: a request in flight
    /// since before it, or a retry still scheduled after an attempt before it.
    pub fn stalled_since(&self, deadline: Instant) -> bool {
        if let Some(since) = self.in_flight_since {
            return since < deadline;
        }
        self.pending_retry.is_some() && self.last_attempt.map(|t| t < deadline).unwrap_or(true)
    }
}
