//! Feed health monitoring.
//!
//! Grades every feed tracker from its failure count and in-flight age, and rolls the
//! grades up into one replication status. The engine uses [`HealthMonitor::stale_feeds`]
//! to reschedule feeds that made no attempt within the stale threshold, either stuck in
//! a request or still waiting out their backoff.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::ReplicationFailure;
use crate::stream::Stream;
use crate::tracker::FeedTracker;

/// Health of one feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FeedHealth {
    /// Last attempt succeeded.
    Healthy,
    /// Failing, still under the failing threshold.
    Retrying {
        /// Consecutive failures.
        failures: u32,
    },
    /// Failures reached the failing threshold.
    Failing {
        /// Consecutive failures.
        failures: u32,
    },
    /// A request has been in flight longer than the stale threshold.
    Stalled {
        /// How long it has been in flight.
        in_flight_ms: u64,
    },
}

/// Diagnostics for one feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealthReport {
    /// Destination stream.
    pub stream: String,
    /// Feed key.
    pub feed: String,
    /// Grade.
    pub health: FeedHealth,
    /// Highest origin sequence applied.
    pub last_applied: u64,
    /// Consecutive failures.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_error: Option<ReplicationFailure>,
    /// Messages stored through the feed since start.
    pub applied_total: u64,
    /// Whether a retry is scheduled.
    pub retry_pending: bool,
}

/// Overall replication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationHealth {
    /// Every feed is healthy.
    Healthy,
    /// Some feeds retry, most are fine.
    Degraded,
    /// Most feeds fail or stall.
    Critical,
    /// No feeds exist.
    NotConfigured,
}

/// Thresholds for grading feeds.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// In-flight age after which a feed counts as stalled.
    pub stale_after: Duration,
    /// Consecutive failures before a feed counts as failing.
    pub failing_failures: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5),
            failing_failures: 5,
        }
    }
}

/// Grades feeds against fixed thresholds.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    /// A monitor using `thresholds`.
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    /// Thresholds in use.
    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Grade one tracker.
    pub fn assess(&self, tracker: &FeedTracker, now: Instant) -> FeedHealth {
        if let Some(since) = tracker.in_flight_since {
            let age = now.saturating_duration_since(since);
            if age > self.thresholds.stale_after {
                return FeedHealth::Stalled {
                    in_flight_ms: age.as_millis() as u64,
                };
            }
        }
        match tracker.consecutive_failures {
            0 => FeedHealth::Healthy,
            f if f >= self.thresholds.failing_failures => FeedHealth::Failing { failures: f },
            f => FeedHealth::Retrying { failures: f },
        }
    }

    /// Diagnostics for one tracker of `stream`.
    pub fn report(&self, stream: &str, tracker: &FeedTracker, now: Instant) -> FeedHealthReport {
        FeedHealthReport {
            stream: stream.to_string(),
            feed: tracker.key(),
            health: self.assess(tracker, now),
            last_applied: tracker.last_applied,
            consecutive_failures: tracker.consecutive_failures,
            last_error: tracker.last_error.clone(),
            applied_total: tracker.applied_total,
            retry_pending: tracker.pending_retry.is_some(),
        }
    }

    /// Keys of the stream's feeds with no attempt since `now - stale_after`.
    pub fn stale_feeds(&self, stream: &Stream, now: Instant) -> Vec<String> {
        let Some(deadline) = now.checked_sub(self.thresholds.stale_after) else {
            return Vec::new();
        };
        stream
            .trackers()
            .into_iter()
            .filter(|t| t.stalled_since(deadline))
            .map(|t| t.key())
            .collect()
    }

    /// Roll feed grades up into one status.
    pub fn overall(reports: &[FeedHealthReport]) -> ReplicationHealth {
        if reports.is_empty() {
            return ReplicationHealth::NotConfigured;
        }
        let mut retrying = 0;
        let mut bad = 0;
        for report in reports {
            match report.health {
                FeedHealth::Healthy => {}
                FeedHealth::Retrying { .. } => retrying += 1,
                FeedHealth::Failing { .. } | FeedHealth::Stalled { .. } => bad += 1,
            }
        }
        if bad > reports.len() / 2 {
            ReplicationHealth::Critical
        } else if retrying > 0 || bad > 0 {
            ReplicationHealth::Degraded
        } else {
            ReplicationHealth::Healthy
        }
    }
}
