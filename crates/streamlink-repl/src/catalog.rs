//! Streams hosted by one deployment, by name.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ReplError;
use crate::stream::Stream;

/// Concurrent name to stream map.
#[derive(Default)]
pub struct StreamCatalog {
    streams: DashMap<String, Arc<Stream>>,
}

impl StreamCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream; names are unique.
    pub fn insert(&self, stream: Stream) -> Result<Arc<Stream>, ReplError> {
        match self.streams.entry(stream.name().to_string()) {
            Entry::Occupied(entry) => Err(ReplError::StreamExists {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                let stream = Arc::new(stream);
                entry.insert(Arc::clone(&stream));
                Ok(stream)
            }
        }
    }

    /// Stream by name.
    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Remove a stream.
    pub fn remove(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.remove(name).map(|(_, s)| s)
    }

    /// Sorted stream names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.streams.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Every stream.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if no streams exist.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
