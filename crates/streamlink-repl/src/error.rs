//! Error types for the replication subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by stream and engine operations.
#[derive(Debug, Error)]
pub enum ReplError {
    /// No stream with this name.
    #[error("stream not found: {name}")]
    UnknownStream {
        /// Stream name.
        name: String,
    },

    /// A stream with this name already exists.
    #[error("stream already exists: {name}")]
    StreamExists {
        /// Stream name.
        name: String,
    },

    /// Mirrors only take messages from their origin.
    #[error("stream {stream} is a mirror and does not accept direct publishes")]
    MirrorPublish {
        /// Mirror stream name.
        stream: String,
    },

    /// The subject is not bound to the stream.
    #[error("subject {subject} does not match stream {stream}")]
    SubjectMismatch {
        /// Stream name.
        stream: String,
        /// Rejected subject.
        subject: String,
    },

    /// Stream configuration is unusable.
    #[error("invalid stream config for {stream}: {msg}")]
    InvalidConfig {
        /// Stream name.
        stream: String,
        /// What is wrong.
        msg: String,
    },

    /// No feed with this key on the stream.
    #[error("stream {stream} has no feed {feed}")]
    UnknownFeed {
        /// Stream name.
        stream: String,
        /// Feed key.
        feed: String,
    },

    /// Checkpoint encode/decode error.
    #[error("checkpoint serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

/// Why one replication attempt failed. Absorbed by the backoff policy and kept on
/// the feed for diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationFailure {
    /// The origin's domain is not reachable.
    #[error("origin domain {domain} unreachable")]
    OriginUnreachable {
        /// Target domain, empty for the local one.
        domain: String,
    },

    /// The origin stream does not exist.
    #[error("origin stream {stream} not found")]
    StreamNotFound {
        /// Origin stream.
        stream: String,
    },

    /// The origin refused to create the consumer.
    #[error("consumer create denied: {reason}")]
    ConsumerDenied {
        /// Reason given by the origin.
        reason: String,
    },

    /// The bridge does not permit this API subject.
    #[error("permission denied for subject {subject}")]
    PermissionDenied {
        /// Denied subject.
        subject: String,
    },

    /// The origin no longer knows the consumer.
    #[error("consumer {consumer} not found")]
    ConsumerNotFound {
        /// Consumer name.
        consumer: String,
    },

    /// No answer within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// Health monitor gave up on an attempt that made no progress.
    #[error("feed stalled")]
    Stalled,
}

impl ReplicationFailure {
    /// Whether the failure invalidates the current consumer.
    pub fn resets_consumer(&self) -> bool {
        matches!(
            self,
            ReplicationFailure::ConsumerNotFound { .. }
                | ReplicationFailure::StreamNotFound { .. }
                | ReplicationFailure::Timeout
                | ReplicationFailure::Stalled
        )
    }
}
