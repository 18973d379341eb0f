//! A hosted consensus group: the Raft core plus timers, persistence and the
//! observer capability flag.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::consensus::{RaftConfig, RaftNode};
use crate::log_store::LogStore;
use crate::types::*;

/// Election and heartbeat timing for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTiming {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
}

impl GroupTiming {
    fn from_config(config: &RaftConfig) -> Self {
        Self {
            election_timeout_min: Duration::from_millis(config.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(
                config.election_timeout_max_ms.max(config.election_timeout_min_ms),
            ),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Snapshot of a group for status reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupStatus {
    /// Group name
    pub name: String,
    /// Asset kind
    pub kind: GroupKind,
    /// Current term
    pub term: u64,
    /// Local role
    pub role: RaftState,
    /// Known leader, if any
    pub leader: Option<PeerId>,
    /// Whether the local member is an observer
    pub observer: bool,
    /// Whether a bridge loss is pending against this group
    pub link_lost: bool,
    /// Voting members as known locally
    pub members: Vec<PeerId>,
    /// Highest committed index
    pub commit_index: u64,
}

impl GroupStatus {
    /// A group without a leader is stalled until an election succeeds.
    pub fn is_stalled(&self) -> bool {
        self.leader.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkLoss {
    since: Instant,
    force: bool,
}

struct GroupInner {
    node: RaftNode,
    observer: bool,
    link_loss: Option<LinkLoss>,
    election_deadline: Instant,
    next_heartbeat: Instant,
    quorum_check_at: Instant,
    last_leader_contact: Instant,
    outbox: Vec<(PeerId, RaftMessage)>,
    committed: Vec<LogEntry>,
    persisted: HardState,
}

/// One consensus group hosted on this server.
pub struct ConsensusGroup {
    name: String,
    kind: GroupKind,
    local: PeerId,
    timing: GroupTiming,
    store: Arc<dyn LogStore>,
    inner: Mutex<GroupInner>,
    wake: Notify,
}

impl ConsensusGroup {
    /// Creates a group, restoring any state already in `store`.
    pub fn new(
        name: impl Into<String>,
        kind: GroupKind,
        config: RaftConfig,
        store: Arc<dyn LogStore>,
        now: Instant,
    ) -> Result<Self, ConsensusError> {
        let name = name.into();
        let timing = GroupTiming::from_config(&config);
        let local = config.local_id;
        let (hard, entries) = store.load()?;
        let mut node = if entries.is_empty() && hard == HardState::default() {
            RaftNode::new(config)
        } else {
            RaftNode::restore(config, hard, entries)
        };
        // committed history goes back to the state machine after a restart
        let replay = node.take_committed_entries();

        tracing::info!(group = %name, kind = %kind, local_id = %local, "consensus group created");
        Ok(Self {
            name,
            kind,
            local,
            timing,
            store,
            inner: Mutex::new(GroupInner {
                persisted: node.hard_state(),
                node,
                observer: false,
                link_loss: None,
                election_deadline: now + timing.random_election_timeout(),
                next_heartbeat: now,
                quorum_check_at: now + timing.election_timeout_max,
                last_leader_contact: now,
                outbox: Vec::new(),
                committed: replay,
            }),
            wake: Notify::new(),
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asset kind.
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Local member id.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Timing in effect for this group.
    pub fn timing(&self) -> GroupTiming {
        self.timing
    }

    /// Signalled whenever outbound messages or committed entries are queued.
    pub fn notified(&self) -> &Notify {
        &self.wake
    }

    /// Handle a message from another member.
    pub fn step(&self, from: PeerId, msg: RaftMessage, now: Instant) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let reply = if inner.observer {
                    tracing::debug!(group = %self.name, candidate = %candidate_id, "observer ignoring vote request");
                    RaftMessage::RequestVoteResponse {
                        term: inner.node.current_term(),
                        vote_granted: false,
                    }
                } else {
                    let reply = inner.node.handle_request_vote(
                        term,
                        candidate_id,
                        last_log_index,
                        last_log_term,
                    );
                    if matches!(reply, RaftMessage::RequestVoteResponse { vote_granted: true, .. }) {
                        inner.election_deadline = now + self.timing.random_election_timeout();
                    }
                    reply
                };
                inner.outbox.push((from, reply));
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                let out = inner.node.handle_vote_response(from, term, vote_granted);
                if inner.node.state() == RaftState::Leader {
                    inner.next_heartbeat = now + self.timing.heartbeat_interval;
                    inner.quorum_check_at = now + self.timing.election_timeout_max;
                }
                inner.outbox.extend(out);
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let reply = inner.node.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    &entries,
                    leader_commit,
                );
                if term >= inner.node.current_term() {
                    inner.last_leader_contact = now;
                    inner.election_deadline = now + self.timing.random_election_timeout();
                }
                inner.outbox.push((from, reply));
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                let out = inner
                    .node
                    .handle_append_response(from, term, success, match_index);
                inner.outbox.extend(out);
            }
            RaftMessage::ForwardProposal { op } => {
                if inner.node.state() == RaftState::Leader && !inner.observer {
                    let out = inner.node.propose(op)?;
                    inner.outbox.extend(out);
                } else {
                    tracing::debug!(group = %self.name, from = %from, "dropping forwarded proposal, not leader");
                }
            }
        }
        self.finish(&mut inner)
    }

    /// Drive timers: heartbeats, elections, check-quorum and link-loss demotion.
    pub fn tick(&self, now: Instant) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();

        if inner.node.state() == RaftState::Leader {
            inner.last_leader_contact = now;
            if now >= inner.next_heartbeat {
                let out = inner.node.broadcast_append();
                inner.outbox.extend(out);
                inner.next_heartbeat = now + self.timing.heartbeat_interval;
            }
            if now >= inner.quorum_check_at {
                if !inner.node.check_quorum() {
                    tracing::warn!(group = %self.name, term = %inner.node.current_term(), "leader lost contact with quorum, stepping down");
                    inner.node.relinquish();
                    inner.election_deadline = now + self.timing.random_election_timeout();
                }
                inner.quorum_check_at = now + self.timing.election_timeout_max;
            }
        } else if !inner.observer && inner.node.is_member() && now >= inner.election_deadline {
            let out = inner.node.start_election();
            if inner.node.state() == RaftState::Leader {
                inner.next_heartbeat = now + self.timing.heartbeat_interval;
                inner.quorum_check_at = now + self.timing.election_timeout_max;
            }
            inner.outbox.extend(out);
            inner.election_deadline = now + self.timing.random_election_timeout();
        }

        if let Some(loss) = inner.link_loss {
            if !inner.observer && self.link_loss_expired(&inner, loss, now) {
                self.enter_observer(&mut inner, now);
            }
        }

        self.finish(&mut inner)
    }

    fn link_loss_expired(&self, inner: &GroupInner, loss: LinkLoss, now: Instant) -> bool {
        let window = self.timing.election_timeout_max;
        if now.duration_since(loss.since) < window {
            return false;
        }
        loss.force || now.duration_since(inner.last_leader_contact) >= window
    }

    fn enter_observer(&self, inner: &mut GroupInner, now: Instant) {
        tracing::info!(
            group = %self.name,
            term = %inner.node.current_term(),
            role = %inner.node.state(),
            "entering observer mode"
        );
        inner.node.relinquish();
        inner.observer = true;
        inner.election_deadline = now + self.timing.random_election_timeout();
    }

    /// Flip the observer flag. The metadata group refuses observer mode. Leaving
    /// observer mode arms a fresh election deadline.
    pub fn set_observer(&self, observer: bool, now: Instant) -> Result<(), ConsensusError> {
        if observer && self.kind == GroupKind::Meta {
            return Err(ConsensusError::MetaObserver);
        }
        let mut inner = self.inner.lock();
        if observer {
            if !inner.observer {
                self.enter_observer(&mut inner, now);
            }
        } else {
            inner.link_loss = None;
            if inner.observer {
                tracing::info!(group = %self.name, "leaving observer mode");
                inner.observer = false;
            }
            inner.last_leader_contact = now;
            inner.election_deadline = now + self.timing.random_election_timeout();
        }
        Ok(())
    }

    /// Record that a bridge this group depends on went away. The group becomes an
    /// observer on a later tick once the loss outlives the election timeout. With
    /// `force` the demotion does not wait for leader contact to lapse.
    /// Returns false for the metadata group, which is exempt.
    pub fn mark_link_lost(&self, now: Instant, force: bool) -> bool {
        if self.kind == GroupKind::Meta {
            return false;
        }
        let mut inner = self.inner.lock();
        let loss = inner.link_loss.get_or_insert(LinkLoss { since: now, force });
        loss.force |= force;
        true
    }

    /// Restore voter status after the bridge came back.
    pub fn clear_link_lost(&self, now: Instant) -> Result<(), ConsensusError> {
        self.set_observer(false, now)
    }

    /// Whether the local member is an observer.
    pub fn is_observer(&self) -> bool {
        self.inner.lock().observer
    }

    /// Local role.
    pub fn role(&self) -> RaftState {
        self.inner.lock().node.state()
    }

    /// Known leader.
    pub fn leader(&self) -> Option<PeerId> {
        self.inner.lock().node.leader_id()
    }

    /// Whether the local member leads the group.
    pub fn is_leader(&self) -> bool {
        self.role() == RaftState::Leader
    }

    /// Current term.
    pub fn term(&self) -> Term {
        self.inner.lock().node.current_term()
    }

    /// Voting members, including the local member when it votes.
    pub fn members(&self) -> Vec<PeerId> {
        let inner = self.inner.lock();
        let mut members = inner.node.peers().to_vec();
        if inner.node.is_member() {
            members.push(self.local);
        }
        members.sort();
        members
    }

    /// Whether `peer` is a voting member as known locally.
    pub fn has_member(&self, peer: PeerId) -> bool {
        self.inner.lock().node.has_member(peer)
    }

    /// Propose an operation on the local leader.
    pub fn propose(&self, op: GroupOp) -> Result<LogIndex, ConsensusError> {
        let mut inner = self.inner.lock();
        if inner.observer {
            return Err(ConsensusError::Observer {
                group: self.name.clone(),
            });
        }
        let out = inner.node.propose(op)?;
        inner.outbox.extend(out);
        let index = inner.node.last_log_index();
        self.finish(&mut inner)?;
        Ok(index)
    }

    /// Propose locally when leading, otherwise hand the operation to the known leader.
    pub fn propose_or_forward(&self, op: GroupOp) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        if inner.node.state() == RaftState::Leader && !inner.observer {
            let out = inner.node.propose(op)?;
            inner.outbox.extend(out);
            return self.finish(&mut inner);
        }
        match inner.node.leader_id() {
            Some(leader) if leader != self.local => {
                tracing::debug!(group = %self.name, leader = %leader, "forwarding proposal to leader");
                inner.outbox.push((leader, RaftMessage::ForwardProposal { op }));
                drop(inner);
                self.wake.notify_one();
                Ok(())
            }
            _ => Err(ConsensusError::NoLeader {
                group: self.name.clone(),
            }),
        }
    }

    /// Drop local history and wait to be added to an existing group by its leader.
    pub fn reset_for_join(&self, now: Instant) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        inner.node.reset_for_join();
        inner.committed.clear();
        inner.last_leader_contact = now;
        inner.election_deadline = now + self.timing.random_election_timeout();
        self.finish(&mut inner)
    }

    /// Committed entries not yet handed to the state machine.
    pub fn take_committed(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.inner.lock().committed)
    }

    /// Messages waiting to be sent.
    pub fn take_outbox(&self) -> Vec<(PeerId, RaftMessage)> {
        std::mem::take(&mut self.inner.lock().outbox)
    }

    /// Status snapshot.
    pub fn status(&self) -> GroupStatus {
        let inner = self.inner.lock();
        let mut members = inner.node.peers().to_vec();
        if inner.node.is_member() {
            members.push(self.local);
        }
        members.sort();
        GroupStatus {
            name: self.name.clone(),
            kind: self.kind,
            term: inner.node.current_term().as_u64(),
            role: inner.node.state(),
            leader: inner.node.leader_id(),
            observer: inner.observer,
            link_lost: inner.link_loss.is_some(),
            members,
            commit_index: inner.node.commit_index().as_u64(),
        }
    }

    fn finish(&self, inner: &mut GroupInner) -> Result<(), ConsensusError> {
        if let Some(changes) = inner.node.take_log_changes() {
            self.store.apply_changes(&changes)?;
        }
        let hard = inner.node.hard_state();
        if hard != inner.persisted {
            self.store.save_hard_state(&hard)?;
            inner.persisted = hard;
        }
        let committed = inner.node.take_committed_entries();
        let notify = !committed.is_empty() || !inner.outbox.is_empty();
        inner.committed.extend(committed);
        if notify {
            self.wake.notify_one();
        }
        Ok(())
    }
}
