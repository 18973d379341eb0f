//! Durable storage for a group's hard state and log entries.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bincode::Options;
use parking_lot::Mutex;

use crate::consensus::LogChanges;
use crate::types::{ConsensusError, HardState, LogEntry, LogIndex};

/// Ordered, durable log interface a consensus group persists through.
pub trait LogStore: Send + Sync {
    /// Load everything persisted so far.
    fn load(&self) -> Result<(HardState, Vec<LogEntry>), ConsensusError>;

    /// Persist term, vote and commit index.
    fn save_hard_state(&self, state: &HardState) -> Result<(), ConsensusError>;

    /// Append entries after the current last index.
    fn append(&self, entries: &[LogEntry]) -> Result<(), ConsensusError>;

    /// Drop every entry at or after `from`.
    fn truncate_from(&self, from: LogIndex) -> Result<(), ConsensusError>;

    /// Read entries in `[from, to]`.
    fn read(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>, ConsensusError>;

    /// Apply the changes a [`crate::consensus::RaftNode`] accumulated.
    fn apply_changes(&self, changes: &LogChanges) -> Result<(), ConsensusError> {
        self.truncate_from(changes.truncate_from)?;
        self.append(&changes.entries)
    }
}

#[derive(Default)]
struct LogState {
    hard: HardState,
    entries: Vec<LogEntry>,
}

impl LogState {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), ConsensusError> {
        for entry in entries {
            let expected = self.entries.len() as u64 + 1;
            if entry.index.as_u64() != expected {
                return Err(ConsensusError::Storage(format!(
                    "non-contiguous append: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_from(&mut self, from: LogIndex) {
        let keep = from.as_u64().saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    fn read(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let start = from.as_u64().saturating_sub(1) as usize;
        let end = std::cmp::min(to.as_u64() as usize, self.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }
}

/// In-memory log, used by tests and by groups that need no durability.
#[derive(Default)]
pub struct MemLogStore {
    state: Mutex<LogState>,
}

impl MemLogStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemLogStore {
    fn load(&self) -> Result<(HardState, Vec<LogEntry>), ConsensusError> {
        let state = self.state.lock();
        Ok((state.hard, state.entries.clone()))
    }

    fn save_hard_state(&self, hard: &HardState) -> Result<(), ConsensusError> {
        self.state.lock().hard = *hard;
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), ConsensusError> {
        self.state.lock().append(entries)
    }

    fn truncate_from(&self, from: LogIndex) -> Result<(), ConsensusError> {
        self.state.lock().truncate_from(from);
        Ok(())
    }

    fn read(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>, ConsensusError> {
        Ok(self.state.lock().read(from, to))
    }
}

/// File-backed log stand-in for the storage engine. Each change rewrites the
/// affected file through a temporary and a rename.
pub struct FileLogStore {
    dir: PathBuf,
    state: Mutex<LogState>,
}

const HARD_STATE_FILE: &str = "hard_state.bin";
const ENTRIES_FILE: &str = "entries.bin";

impl FileLogStore {
    /// Opens (or creates) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ConsensusError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let hard = match fs::read(dir.join(HARD_STATE_FILE)) {
            Ok(bytes) => Self::options().deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e.into()),
        };
        let entries = match fs::read(dir.join(ENTRIES_FILE)) {
            Ok(bytes) => Self::options().deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(dir = %dir.display(), "opened file log store");
        Ok(Self {
            dir,
            state: Mutex::new(LogState { hard, entries }),
        })
    }

    fn options() -> impl Options {
        bincode::DefaultOptions::new().with_fixint_encoding()
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), ConsensusError> {
        let tmp = self.dir.join(format!("{}.tmp", name));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }

    fn persist_entries(&self, state: &LogState) -> Result<(), ConsensusError> {
        let bytes = Self::options().serialize(&state.entries)?;
        self.write_atomic(ENTRIES_FILE, &bytes)
    }
}

impl LogStore for FileLogStore {
    fn load(&self) -> Result<(HardState, Vec<LogEntry>), ConsensusError> {
        let state = self.state.lock();
        Ok((state.hard, state.entries.clone()))
    }

    fn save_hard_state(&self, hard: &HardState) -> Result<(), ConsensusError> {
        let mut state = self.state.lock();
        let bytes = Self::options().serialize(hard)?;
        self.write_atomic(HARD_STATE_FILE, &bytes)?;
        state.hard = *hard;
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), ConsensusError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.append(entries)?;
        self.persist_entries(&state)
    }

    fn truncate_from(&self, from: LogIndex) -> Result<(), ConsensusError> {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.truncate_from(from);
        if state.entries.len() != before {
            self.persist_entries(&state)?;
        }
        Ok(())
    }

    fn read(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>, ConsensusError> {
        Ok(self.state.lock().read(from, to))
    }

    fn apply_changes(&self, changes: &LogChanges) -> Result<(), ConsensusError> {
        let mut state = self.state.lock();
        state.truncate_from(changes.truncate_from);
        state.append(&changes.entries)?;
        self.persist_entries(&state)
    }
}
