#![warn(missing_docs)]

//! streamlink replication subsystem: mirrors and sources kept in sync across bridge links

pub mod backoff;
pub mod catalog;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod health;
pub mod origin;
pub mod stream;
pub mod tracker;

pub use backoff::BackoffConfig;
pub use catalog::StreamCatalog;
pub use checkpoint::{CheckpointStore, FeedCheckpoint, StreamCheckpoint};
pub use engine::{EngineConfig, ReplicationEngine};
pub use error::{ReplError, ReplicationFailure};
pub use health::{FeedHealth, FeedHealthReport, HealthMonitor, HealthThresholds, ReplicationHealth};
pub use origin::{
    api_prefix, parse_api_prefix, ConsumerInfo, ConsumerRequest, DomainDirectory, LinkState,
    OriginApi, OriginClient, LOCAL_API_PREFIX,
};
pub use stream::{subject_matches, ApplyOutcome, MessageLog, OriginRef, StoredMessage, Stream, StreamConfig};
pub use tracker::{FeedSpec, FeedTracker};
