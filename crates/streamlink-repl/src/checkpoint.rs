//! Durable feed checkpoints.
//!
//! A checkpoint captures the bookkeeping of every feed of one stream. On restart the
//! engine resumes each feed from the destination's last stored origin sequence, or from
//! the start when the destination holds nothing from that feed. The checkpointed
//! position never moves a feed past messages the destination does not hold.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReplError, ReplicationFailure};
use crate::stream::{Stream, StreamConfig};
use crate::tracker::{FeedSpec, FeedTracker};

const EXTENSION: &str = "ckpt";

/// Saved bookkeeping of one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedCheckpoint {
    /// Feed identity.
    pub spec: FeedSpec,
    /// Highest origin sequence applied.
    pub last_applied: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_error: Option<ReplicationFailure>,
}

impl FeedCheckpoint {
    /// Capture a tracker.
    pub fn from_tracker(tracker: &FeedTracker) -> Self {
        Self {
            spec: tracker.spec.clone(),
            last_applied: tracker.last_applied,
            consecutive_failures: tracker.consecutive_failures,
            last_error: tracker.last_error.clone(),
        }
    }
}

/// Saved bookkeeping of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    /// Stream definition, including sources added at runtime.
    pub config: StreamConfig,
    /// One entry per feed.
    pub feeds: Vec<FeedCheckpoint>,
    /// Fingerprint of the feed positions.
    pub fingerprint: u64,
}

impl StreamCheckpoint {
    /// Capture a stream.
    pub fn capture(stream: &Stream) -> Self {
        let feeds: Vec<FeedCheckpoint> = stream
            .trackers()
            .iter()
            .map(FeedCheckpoint::from_tracker)
            .collect();
        let mut config = stream.config().clone();
        if config.mirror.is_none() {
            config.sources = feeds.iter().map(|f| f.spec.clone()).collect();
        }
        let fingerprint = Self::compute_fingerprint(&feeds);
        Self {
            config,
            feeds,
            fingerprint,
        }
    }

    /// Fingerprint over feed keys and positions.
    pub fn compute_fingerprint(feeds: &[FeedCheckpoint]) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        let mut positions: Vec<(String, u64)> =
            feeds.iter().map(|f| (f.spec.key(), f.last_applied)).collect();
        positions.sort();
        positions.hash(&mut hasher);
        hasher.finish()
    }

    /// Stream name.
    pub fn stream(&self) -> &str {
        &self.config.name
    }

    /// Checkpoint of one feed.
    pub fn feed(&self, key: &str) -> Option<&FeedCheckpoint> {
        self.feeds.iter().find(|f| f.spec.key() == key)
    }

    /// Carry the failure bookkeeping of this checkpoint over to a restored stream.
    /// Positions stay where the stream's stored messages put them.
    pub fn apply_to(&self, stream: &Stream) {
        for saved in &self.feeds {
            let key = saved.spec.key();
            let restored = stream.with_tracker(&key, |t| {
                t.consecutive_failures = saved.consecutive_failures;
                t.last_error = saved.last_error.clone();
                t.last_applied
            });
            match restored {
                Ok(resume) if resume < saved.last_applied => tracing::info!(
                    stream = %self.stream(),
                    feed = %key,
                    checkpoint = saved.last_applied,
                    resume,
                    "destination behind checkpoint, refetching"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    stream = %self.stream(),
                    feed = %key,
                    error = %e,
                    "checkpointed feed not configured on stream"
                ),
            }
        }
    }

    /// Serialize to bincode bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Checkpoint files in one directory, one per stream.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, stream: &str) -> PathBuf {
        let safe: String = stream
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.{}", safe, EXTENSION))
    }

    /// Write a checkpoint, replacing the previous one atomically.
    pub fn save(&self, checkpoint: &StreamCheckpoint) -> Result<(), ReplError> {
        let path = self.path_for(checkpoint.stream());
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, checkpoint.to_bytes()?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::trace!(stream = %checkpoint.stream(), feeds = checkpoint.feeds.len(), "checkpoint saved");
        Ok(())
    }

    /// Checkpoint of `stream`, if one was saved.
    pub fn load(&self, stream: &str) -> Result<Option<StreamCheckpoint>, ReplError> {
        match fs::read(self.path_for(stream)) {
            Ok(data) => Ok(Some(StreamCheckpoint::from_bytes(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every saved checkpoint, ordered by stream name. Unreadable files are skipped.
    pub fn load_all(&self) -> Result<Vec<StreamCheckpoint>, ReplError> {
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match fs::read(&path).map_err(ReplError::from).and_then(|data| {
                StreamCheckpoint::from_bytes(&data).map_err(ReplError::from)
            }) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| a.stream().cmp(b.stream()));
        Ok(checkpoints)
    }

    /// Delete the checkpoint of `stream`.
    pub fn remove(&self, stream: &str) -> Result<(), ReplError> {
        match fs::remove_file(self.path_for(stream)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{OriginRef, StoredMessage};
    use bytes::Bytes;

    fn sourced() -> Stream {
        Stream::new(StreamConfig::sourced(
            "AGG",
            vec![FeedSpec::new("EU"), FeedSpec::new("US").with_domain("hub")],
        ))
        .unwrap()
    }

    fn origin_msg(seq: u64) -> StoredMessage {
        StoredMessage {
            seq,
            subject: "orders.eu".into(),
            payload: Bytes::from_static(b"x"),
            origin: None,
        }
    }

    mod capture {
        use super::*;

        #[test]
        fn test_capture_includes_runtime_sources() {
            let stream = sourced();
            stream.add_feed(FeedSpec::new("APAC"), 3).unwrap();
            let checkpoint = StreamCheckpoint::capture(&stream);
            assert_eq!(checkpoint.feeds.len(), 3);
            assert_eq!(checkpoint.config.sources.len(), 3);
            assert_eq!(checkpoint.feed("APAC").unwrap().last_applied, 3);
        }

        #[test]
        fn test_fingerprint_tracks_positions() {
            let stream = sourced();
            let before = StreamCheckpoint::capture(&stream);
            stream.apply_feed("EU", &[origin_msg(1)]).unwrap();
            let after = StreamCheckpoint::capture(&stream);
            assert_ne!(before.fingerprint, after.fingerprint);
            assert_eq!(
                after.fingerprint,
                StreamCheckpoint::capture(&stream).fingerprint
            );
        }
    }

    mod recovery {
        use super::*;

        #[test]
        fn test_resume_follows_stored_messages() {
            let stream = sourced();
            stream.apply_feed("EU", &[origin_msg(1), origin_msg(2)]).unwrap();
            stream
                .with_tracker("US@hub", |t| {
                    t.last_applied = 40;
                    t.consecutive_failures = 3;
                    t.last_error = Some(ReplicationFailure::Timeout);
                })
                .unwrap();
            let mut checkpoint = StreamCheckpoint::capture(&stream);
            checkpoint.feeds[0].last_applied = 1;

            let restored = Stream::restore(checkpoint.config.clone(), stream.messages()).unwrap();
            checkpoint.apply_to(&restored);

            assert_eq!(restored.tracker("EU").unwrap().last_applied, 2);
            // nothing stored from US@hub, so it starts over
            let us = restored.tracker("US@hub").unwrap();
            assert_eq!(us.last_applied, 0);
            assert_eq!(us.consecutive_failures, 3);
            assert_eq!(us.last_error, Some(ReplicationFailure::Timeout));
        }
    }

    mod store {
        use super::*;

        #[test]
        fn test_save_load_remove() {
            let dir = tempfile::tempdir().unwrap();
            let store = CheckpointStore::open(dir.path().join("ckpt")).unwrap();
            let stream = sourced();
            stream.apply_feed("EU", &[origin_msg(7)]).unwrap();
            let checkpoint = StreamCheckpoint::capture(&stream);

            store.save(&checkpoint).unwrap();
            store.save(&checkpoint).unwrap();
            assert_eq!(store.load("AGG").unwrap(), Some(checkpoint));
            assert_eq!(store.load("MISSING").unwrap(), None);
            assert_eq!(store.load_all().unwrap().len(), 1);

            store.remove("AGG").unwrap();
            store.remove("AGG").unwrap();
            assert!(store.load_all().unwrap().is_empty());
        }

        #[test]
        fn test_garbage_file_is_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let store = CheckpointStore::open(dir.path()).unwrap();
            fs::write(dir.path().join("junk.ckpt"), b"\xff\xff\xff").unwrap();
            fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
            store.save(&StreamCheckpoint::capture(&sourced())).unwrap();
            let all = store.load_all().unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].stream(), "AGG");
        }

        #[test]
        fn test_mirror_origin_refs_survive_restart() {
            let dir = tempfile::tempdir().unwrap();
            let store = CheckpointStore::open(dir.path()).unwrap();
            let mirror = Stream::new(StreamConfig::mirror("M", FeedSpec::new("ORDERS"))).unwrap();
            mirror.apply_feed("ORDERS", &[origin_msg(1), origin_msg(2)]).unwrap();
            store.save(&StreamCheckpoint::capture(&mirror)).unwrap();

            let checkpoint = store.load("M").unwrap().unwrap();
            let restored = Stream::restore(checkpoint.config.clone(), mirror.messages()).unwrap();
            checkpoint.apply_to(&restored);
            assert_eq!(
                restored.messages()[1].origin,
                Some(OriginRef { feed: "ORDERS".into(), seq: 2 })
            );
            assert_eq!(restored.tracker("ORDERS").unwrap().last_applied, 2);
        }
    }
}
