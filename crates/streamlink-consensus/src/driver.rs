//! One task per hosted group: timers, inbound messages and outbound flushing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::group::ConsensusGroup;
use crate::network::{Envelope, RaftTransport};
use crate::types::LogEntry;

/// A committed entry handed to the state machine that owns the group.
#[derive(Debug, Clone)]
pub struct Committed {
    /// Group the entry was committed in
    pub group: String,
    /// The entry
    pub entry: LogEntry,
}

/// Handle to a running group driver.
pub struct GroupDriver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl GroupDriver {
    /// Spawns the driver loop for `group`.
    pub fn spawn(
        group: Arc<ConsensusGroup>,
        transport: Arc<dyn RaftTransport>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        committed: mpsc::UnboundedSender<Committed>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(group, transport, inbox, committed, cancel.clone()));
        Self { cancel, handle }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "group driver task failed");
        }
    }

    /// Stops the loop without waiting.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

fn tick_period(group: &ConsensusGroup) -> Duration {
    let hb = group.timing().heartbeat_interval;
    std::cmp::max(hb / 2, Duration::from_millis(5))
}

async fn run(
    group: Arc<ConsensusGroup>,
    transport: Arc<dyn RaftTransport>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    committed: mpsc::UnboundedSender<Committed>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick_period(&group));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(group = %group.name(), "group driver started");

    loop {
        flush(&group, transport.as_ref(), &committed);

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(env) => group.step(env.from, env.msg, Instant::now()),
                None => break,
            },
            _ = ticker.tick() => group.tick(Instant::now()),
            _ = group.notified().notified() => Ok(()),
        };

        if let Err(e) = result {
            tracing::error!(group = %group.name(), error = %e, "consensus step failed");
        }
    }

    flush(&group, transport.as_ref(), &committed);
    tracing::debug!(group = %group.name(), "group driver stopped");
}

fn flush(
    group: &ConsensusGroup,
    transport: &dyn RaftTransport,
    committed: &mpsc::UnboundedSender<Committed>,
) {
    for (to, msg) in group.take_outbox() {
        transport.send(Envelope {
            group: group.name().to_string(),
            from: group.local_id(),
            to,
            msg,
        });
    }
    for entry in group.take_committed() {
        // the receiver is gone only during shutdown
        let _ = committed.send(Committed {
            group: group.name().to_string(),
            entry,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::RaftConfig;
    use crate::log_store::MemLogStore;
    use crate::network::LocalNetwork;
    use crate::types::*;

    fn spawn_member(
        net: &Arc<LocalNetwork>,
        id: u64,
        peers: &[u64],
        sink: &mpsc::UnboundedSender<Committed>,
    ) -> (Arc<ConsensusGroup>, GroupDriver) {
        let group = Arc::new(
            ConsensusGroup::new(
                "ORDERS",
                GroupKind::Stream,
                RaftConfig {
                    local_id: PeerId::new(id),
                    peers: peers.iter().map(|p| PeerId::new(*p)).collect(),
                    ..RaftConfig::default()
                },
                Arc::new(MemLogStore::new()),
                Instant::now(),
            )
            .unwrap(),
        );
        let inbox = net.register(PeerId::new(id), "ORDERS");
        let transport: Arc<dyn RaftTransport> = net.clone();
        let driver = GroupDriver::spawn(group.clone(), transport, inbox, sink.clone());
        (group, driver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drivers_elect_and_commit() {
        let net = Arc::new(LocalNetwork::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let members: Vec<_> = [(1, [2, 3]), (2, [1, 3]), (3, [1, 2])]
            .iter()
            .map(|(id, peers)| spawn_member(&net, *id, peers, &tx))
            .collect();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let leaders: Vec<_> = members.iter().filter(|(g, _)| g.is_leader()).collect();
        assert_eq!(leaders.len(), 1);

        leaders[0]
            .0
            .propose(GroupOp::Payload(b"order-1".to_vec()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut payloads = 0;
        while let Ok(c) = rx.try_recv() {
            if matches!(c.entry.op, GroupOp::Payload(_)) {
                payloads += 1;
            }
        }
        assert_eq!(payloads, 3);

        for (_, driver) in members {
            driver.shutdown().await;
        }
    }
}
