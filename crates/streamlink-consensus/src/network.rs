//! Message transport between group members.
//!
//! [`LocalNetwork`] connects servers living in one process over unbounded channels and
//! can cut links between sets of servers to simulate a lost bridge.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::{PeerId, RaftMessage};

/// A consensus message addressed to one member of one group.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Group the message belongs to
    pub group: String,
    /// Sending member
    pub from: PeerId,
    /// Receiving member
    pub to: PeerId,
    /// Payload
    pub msg: RaftMessage,
}

/// Delivers consensus messages. Delivery is best effort; Raft retries.
pub trait RaftTransport: Send + Sync {
    /// Sends a message without waiting for delivery.
    fn send(&self, envelope: Envelope);
}

/// In-process transport with link cutting.
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<(PeerId, String), mpsc::UnboundedSender<Envelope>>>,
    cuts: RwLock<HashSet<(PeerId, PeerId)>>,
    dropped: AtomicU64,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl LocalNetwork {
    /// Creates a network with no endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the inbox for `group` on server `peer`.
    pub fn register(&self, peer: PeerId, group: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert((peer, group.to_string()), tx);
        rx
    }

    /// Removes an inbox; later messages to it are dropped.
    pub fn unregister(&self, peer: PeerId, group: &str) {
        self.inboxes.write().remove(&(peer, group.to_string()));
    }

    /// Cuts every link between a server in `left` and a server in `right`.
    pub fn partition(&self, left: &[PeerId], right: &[PeerId]) {
        let mut cuts = self.cuts.write();
        for a in left {
            for b in right {
                if a != b {
                    cuts.insert(link(*a, *b));
                }
            }
        }
        tracing::info!(left = ?left, right = ?right, "network partitioned");
    }

    /// Restores links cut by [`LocalNetwork::partition`].
    pub fn heal(&self, left: &[PeerId], right: &[PeerId]) {
        let mut cuts = self.cuts.write();
        for a in left {
            for b in right {
                cuts.remove(&link(*a, *b));
            }
        }
        tracing::info!(left = ?left, right = ?right, "network healed");
    }

    /// Whether messages between `a` and `b` are dropped.
    pub fn is_cut(&self, a: PeerId, b: PeerId) -> bool {
        self.cuts.read().contains(&link(a, b))
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RaftTransport for LocalNetwork {
    fn send(&self, envelope: Envelope) {
        if self.is_cut(envelope.from, envelope.to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let inboxes = self.inboxes.read();
        match inboxes.get(&(envelope.to, envelope.group.clone())) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
