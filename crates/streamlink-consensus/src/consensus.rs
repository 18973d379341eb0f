//! Raft state machine for a single consensus group.
//!
//! The node is sans-IO: every handler returns the messages to send and the caller owns
//! timers and transport. Membership changes travel through the log and take effect when
//! the entry commits. Observer mode is not known here; the group wrapper gates
//! elections and votes before calling in.

use std::collections::{HashMap, HashSet};

use crate::types::*;

/// Identity, initial membership and timing of one group member.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Id of the local server
    pub local_id: PeerId,
    /// Initial voting members besides the local server
    pub peers: Vec<PeerId>,
    /// Lower bound of the randomized election timeout, ms
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout, ms
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat period, ms
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            local_id: PeerId::new(0),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

/// Log changes not yet handed to durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChanges {
    /// Entries at or after this index must be dropped from storage first.
    pub truncate_from: LogIndex,
    /// Entries to append after truncation.
    pub entries: Vec<LogEntry>,
}

/// Election, replication and commit state of one group member.
pub struct RaftNode {
    config: RaftConfig,
    state: RaftState,
    current_term: Term,
    voted_for: Option<PeerId>,
    leader_id: Option<PeerId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    membership_applied: LogIndex,
    next_index: HashMap<PeerId, LogIndex>,
    match_index: HashMap<PeerId, LogIndex>,
    votes_received: HashSet<PeerId>,
    recent_contacts: HashSet<PeerId>,
    member: bool,
    dirty_from: Option<usize>,
}

impl RaftNode {
    /// A fresh follower at term zero with an empty log.
    pub fn new(config: RaftConfig) -> Self {
        tracing::debug!(
            local_id = %config.local_id,
            peers = ?config.peers,
            "raft node created"
        );
        Self {
            config,
            state: RaftState::Follower,
            current_term: Term::new(0),
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            membership_applied: LogIndex::ZERO,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            recent_contacts: HashSet::new(),
            member: true,
            dirty_from: None,
        }
    }

    /// Rebuild a node from persisted state.
    ///
    /// Membership entries up to the persisted commit index are replayed so the peer
    /// set matches what the group had agreed on. Every committed entry is handed out
    /// again by [`RaftNode::take_committed_entries`] so the state machine can be
    /// rebuilt; membership is not applied a second time.
    pub fn restore(config: RaftConfig, hard: HardState, log: Vec<LogEntry>) -> Self {
        let mut node = Self::new(config);
        node.current_term = hard.term;
        node.voted_for = hard.voted_for;
        node.log = log;
        node.commit_index = std::cmp::min(hard.commit, node.last_log_index());
        let committed = node.commit_index.as_u64() as usize;
        let ops: Vec<GroupOp> = node.log[..committed]
            .iter()
            .filter(|e| e.op.is_membership())
            .map(|e| e.op.clone())
            .collect();
        for op in &ops {
            node.apply_membership(op);
        }
        node.membership_applied = node.commit_index;
        tracing::info!(
            local_id = %node.config.local_id,
            term = %node.current_term,
            commit = %node.commit_index,
            log_len = node.log.len(),
            "restored Raft node from storage"
        );
        node
    }

    /// This node's identifier.
    pub fn id(&self) -> PeerId {
        self.config.local_id
    }

    /// Other voting members as currently known.
    pub fn peers(&self) -> &[PeerId] {
        &self.config.peers
    }

    /// Returns true when the peer is a voting member (including this node).
    pub fn has_member(&self, peer: PeerId) -> bool {
        (peer == self.config.local_id && self.member) || self.config.peers.contains(&peer)
    }

    /// Whether this node is a voting member of its group.
    pub fn is_member(&self) -> bool {
        self.member
    }

    /// Latest term seen.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Follower, candidate or leader.
    pub fn state(&self) -> RaftState {
        self.state
    }

    /// Leader this node currently follows, or itself when leading.
    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_id
    }

    /// Highest index known to be committed.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Highest index handed out as committed.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Vote cast in the current term.
    pub fn voted_for(&self) -> Option<PeerId> {
        self.voted_for
    }

    /// Durable portion of the node's state.
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit: self.commit_index,
        }
    }

    /// Entries at `from` and after; index zero means the whole log.
    pub fn log_entries_from(&self, from: LogIndex) -> &[LogEntry] {
        let start = (from.as_u64() as usize).saturating_sub(1);
        self.log.get(start..).unwrap_or(&[])
    }

    /// Entry at `index`, if stored.
    pub fn log_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        (index.as_u64() as usize)
            .checked_sub(1)
            .and_then(|pos| self.log.get(pos))
    }

    /// Index of the newest entry, zero when empty.
    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.log.len() as u64)
    }

    /// Term of the newest entry, zero when empty.
    pub fn last_log_term(&self) -> Term {
        self.log.last().map_or(Term::new(0), |e| e.term)
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 2) / 2
    }

    /// Campaign in the next term with a vote for ourselves, returning the vote requests.
    /// A group with no other voters wins immediately and nothing is sent.
    pub fn start_election(&mut self) -> Vec<(PeerId, RaftMessage)> {
        if !self.member {
            tracing::debug!(
                local_id = %self.config.local_id,
                "not a voting member, skipping election"
            );
            return Vec::new();
        }

        self.state = RaftState::Candidate;
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.config.local_id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.config.local_id);

        tracing::info!(
            local_id = %self.config.local_id,
            term = %self.current_term,
            "starting election"
        );

        if self.votes_received.len() >= self.majority() {
            return self.become_leader();
        }

        let msg = RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.config.local_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        self.config
            .peers
            .iter()
            .map(|p| (*p, msg.clone()))
            .collect()
    }

    /// Answer a vote request.
    pub fn handle_request_vote(
        &mut self,
        term: Term,
        candidate_id: PeerId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> RaftMessage {
        tracing::debug!(
            local_id = %self.config.local_id,
            current_term = %self.current_term,
            candidate_term = %term,
            candidate_id = %candidate_id,
            "vote requested"
        );

        if term > self.current_term {
            tracing::info!(
                local_id = %self.config.local_id,
                old_term = %self.current_term,
                new_term = %term,
                "higher term seen, stepping down"
            );
            self.step_down(term);
        }

        let vote_granted = if term < self.current_term || !self.member {
            false
        } else if let Some(voted_for) = self.voted_for {
            voted_for == candidate_id
        } else if !self.is_log_up_to_date(last_log_index, last_log_term) {
            tracing::debug!(
                local_id = %self.config.local_id,
                "vote refused, candidate log is behind"
            );
            false
        } else {
            tracing::info!(
                local_id = %self.config.local_id,
                candidate_id = %candidate_id,
                term = %term,
                "vote granted"
            );
            self.voted_for = Some(candidate_id);
            true
        };

        RaftMessage::RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote reply; winning returns the first round of appends.
    pub fn handle_vote_response(
        &mut self,
        from: PeerId,
        term: Term,
        vote_granted: bool,
    ) -> Vec<(PeerId, RaftMessage)> {
        if term > self.current_term {
            tracing::info!(
                local_id = %self.config.local_id,
                old_term = %self.current_term,
                new_term = %term,
                "vote reply carried a higher term, stepping down"
            );
            self.step_down(term);
            return Vec::new();
        }

        if self.state != RaftState::Candidate || term < self.current_term {
            return Vec::new();
        }

        if vote_granted && self.config.peers.contains(&from) {
            self.votes_received.insert(from);
        }

        if self.votes_received.len() >= self.majority() {
            self.become_leader()
        } else {
            Vec::new()
        }
    }

    fn become_leader(&mut self) -> Vec<(PeerId, RaftMessage)> {
        tracing::info!(
            local_id = %self.config.local_id,
            term = %self.current_term,
            votes = self.votes_received.len(),
            "election won"
        );

        self.state = RaftState::Leader;
        self.leader_id = Some(self.config.local_id);
        self.recent_contacts.clear();
        self.next_index.clear();
        self.match_index.clear();

        let last_idx = self.last_log_index();
        for peer in &self.config.peers {
            self.next_index
                .insert(*peer, LogIndex::new(last_idx.as_u64() + 1));
            self.match_index.insert(*peer, LogIndex::ZERO);
        }

        // A fresh log gets a membership record so joiners can learn the voter set.
        let op = if self.log.iter().any(|e| e.op.is_membership()) {
            GroupOp::Noop
        } else {
            let mut members = self.config.peers.clone();
            members.push(self.config.local_id);
            members.sort();
            GroupOp::SetMembers { members }
        };
        self.append_local(op);
        self.try_advance_commit();
        self.broadcast_append()
    }

    /// Append `op` as leader and return the replication messages.
    pub fn propose(&mut self, op: GroupOp) -> Result<Vec<(PeerId, RaftMessage)>, ConsensusError> {
        if self.state != RaftState::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.leader_id,
            });
        }

        let index = self.append_local(op);
        tracing::debug!(
            local_id = %self.config.local_id,
            term = %self.current_term,
            index = %index,
            "entry appended"
        );
        self.try_advance_commit();
        Ok(self.broadcast_append())
    }

    /// AppendEntries for every peer; doubles as the leader heartbeat.
    pub fn broadcast_append(&self) -> Vec<(PeerId, RaftMessage)> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }
        self.config
            .peers
            .iter()
            .map(|peer| (*peer, self.build_append_entries(*peer)))
            .collect()
    }

    fn append_local(&mut self, op: GroupOp) -> LogIndex {
        let index = LogIndex::new(self.log.len() as u64 + 1);
        self.mark_dirty(self.log.len());
        self.log.push(LogEntry {
            index,
            term: self.current_term,
            op,
        });
        index
    }

    /// Accept or refuse a leader's append request and build the reply.
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: PeerId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: &[LogEntry],
        leader_commit: LogIndex,
    ) -> RaftMessage {
        tracing::trace!(
            local_id = %self.config.local_id,
            current_term = %self.current_term,
            leader_term = %term,
            leader_id = %leader_id,
            prev_log_index = %prev_log_index,
            leader_commit = %leader_commit,
            "append requested"
        );

        if term > self.current_term {
            tracing::info!(
                local_id = %self.config.local_id,
                old_term = %self.current_term,
                new_term = %term,
                "append carried a higher term, stepping down"
            );
            self.step_down(term);
        }

        if term < self.current_term {
            tracing::debug!(
                local_id = %self.config.local_id,
                leader_term = %term,
                "append refused, stale leader term"
            );
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            };
        }

        if self.state != RaftState::Follower {
            tracing::info!(
                local_id = %self.config.local_id,
                leader_id = %leader_id,
                "following current leader"
            );
            self.state = RaftState::Follower;
        }
        self.leader_id = Some(leader_id);

        if prev_log_index.as_u64() > 0 {
            let prev_entry_term = self.log_entry(prev_log_index).map(|e| e.term);
            if prev_entry_term != Some(prev_log_term) {
                tracing::debug!(
                    local_id = %self.config.local_id,
                    prev_log_index = %prev_log_index,
                    expected_term = %prev_log_term,
                    actual_term = ?prev_entry_term,
                    "append refused, log mismatch before batch"
                );
                let keep = std::cmp::min(
                    prev_log_index.as_u64().saturating_sub(1) as usize,
                    self.log.len(),
                );
                self.truncate_log(keep);
                return RaftMessage::AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: self.last_log_index(),
                };
            }
        }

        let start = prev_log_index.as_u64() as usize;
        for (i, entry) in entries.iter().enumerate() {
            let idx = start + i;
            if idx < self.log.len() {
                if self.log[idx].term != entry.term {
                    tracing::debug!(
                        local_id = %self.config.local_id,
                        idx = %entry.index,
                        "truncating conflicting suffix"
                    );
                    self.truncate_log(idx);
                    self.mark_dirty(idx);
                    self.log.push(entry.clone());
                }
            } else {
                self.mark_dirty(idx);
                self.log.push(entry.clone());
            }
        }

        let last_new = LogIndex::new((start + entries.len()) as u64);
        if leader_commit > self.commit_index {
            let new_commit = std::cmp::min(leader_commit, last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
            }
        }

        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last_new,
        }
    }

    /// Record a follower's append reply. Commit advances once a majority matches; a
    /// follower that is behind or diverged gets the next batch straight away.
    pub fn handle_append_response(
        &mut self,
        from: PeerId,
        term: Term,
        success: bool,
        match_index: LogIndex,
    ) -> Vec<(PeerId, RaftMessage)> {
        if term > self.current_term {
            tracing::info!(
                local_id = %self.config.local_id,
                old_term = %self.current_term,
                new_term = %term,
                "append reply carried a higher term, stepping down"
            );
            self.step_down(term);
            return Vec::new();
        }

        if self.state != RaftState::Leader || !self.config.peers.contains(&from) {
            return Vec::new();
        }
        self.recent_contacts.insert(from);

        if success {
            let current = self.match_index.get(&from).copied().unwrap_or(LogIndex::ZERO);
            if match_index > current {
                self.match_index.insert(from, match_index);
            }
            self.next_index
                .insert(from, LogIndex::new(match_index.as_u64() + 1));
            self.try_advance_commit();
            if match_index < self.last_log_index() {
                return vec![(from, self.build_append_entries(from))];
            }
            Vec::new()
        } else {
            let next_idx = self
                .next_index
                .get(&from)
                .copied()
                .unwrap_or(LogIndex::new(1));
            let backed = next_idx.as_u64().saturating_sub(1);
            let new_next = LogIndex::new(std::cmp::max(
                1,
                std::cmp::min(backed, match_index.as_u64() + 1),
            ));
            tracing::debug!(
                local_id = %self.config.local_id,
                from = %from,
                old_next = %next_idx,
                new_next = %new_next,
                "follower diverged, retrying earlier"
            );
            self.next_index.insert(from, new_next);
            vec![(from, self.build_append_entries(from))]
        }
    }

    /// Hand out newly committed entries. Membership entries take effect here.
    pub fn take_committed_entries(&mut self) -> Vec<LogEntry> {
        let start = self.last_applied.as_u64() as usize;
        let end = std::cmp::min(self.commit_index.as_u64() as usize, self.log.len());
        if start >= end {
            return Vec::new();
        }

        let entries: Vec<LogEntry> = self.log[start..end].to_vec();
        self.last_applied = LogIndex::new(end as u64);
        for entry in &entries {
            if entry.op.is_membership() && entry.index > self.membership_applied {
                self.apply_membership(&entry.op);
            }
        }
        self.membership_applied = std::cmp::max(self.membership_applied, self.last_applied);

        tracing::trace!(
            local_id = %self.config.local_id,
            count = entries.len(),
            last_applied = %self.last_applied,
            "committed entries taken"
        );
        entries
    }

    fn apply_membership(&mut self, op: &GroupOp) {
        let me = self.config.local_id;
        match op {
            GroupOp::SetMembers { members } => {
                self.member = members.contains(&me);
                self.config.peers = members.iter().copied().filter(|p| *p != me).collect();
            }
            GroupOp::AddPeer { peer } if *peer == me => {
                self.member = true;
            }
            GroupOp::AddPeer { peer } => {
                if !self.config.peers.contains(peer) {
                    self.config.peers.push(*peer);
                }
            }
            GroupOp::RemovePeer { peer } if *peer == me => {
                self.member = false;
                if self.state != RaftState::Follower {
                    self.state = RaftState::Follower;
                }
            }
            GroupOp::RemovePeer { peer } => {
                self.config.peers.retain(|p| p != peer);
                self.next_index.remove(peer);
                self.match_index.remove(peer);
            }
            GroupOp::Noop | GroupOp::Payload(_) => return,
        }

        if self.state == RaftState::Leader {
            let next = LogIndex::new(self.last_log_index().as_u64() + 1);
            for peer in &self.config.peers {
                self.next_index.entry(*peer).or_insert(next);
                self.match_index.entry(*peer).or_insert(LogIndex::ZERO);
            }
        }

        tracing::info!(
            local_id = %self.config.local_id,
            op = ?op,
            peers = ?self.config.peers,
            member = self.member,
            "applied membership change"
        );
    }

    /// Returns whether a quorum acknowledged this leader since the previous call.
    pub fn check_quorum(&mut self) -> bool {
        if self.state != RaftState::Leader {
            return true;
        }
        let acked = self.recent_contacts.len() + 1;
        self.recent_contacts.clear();
        acked >= self.majority()
    }

    /// Abandon any local history and wait to learn the membership from an existing
    /// group's leader. The term is kept so the node never goes backwards in time.
    pub fn reset_for_join(&mut self) {
        tracing::info!(
            local_id = %self.config.local_id,
            term = %self.current_term,
            "resetting log to join an existing group"
        );
        self.state = RaftState::Follower;
        self.leader_id = None;
        self.voted_for = None;
        self.truncate_log(0);
        self.commit_index = LogIndex::ZERO;
        self.last_applied = LogIndex::ZERO;
        self.membership_applied = LogIndex::ZERO;
        self.config.peers.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.member = false;
    }

    /// Relinquish leadership without changing term.
    pub fn relinquish(&mut self) {
        if self.state != RaftState::Follower {
            tracing::info!(
                local_id = %self.config.local_id,
                term = %self.current_term,
                "relinquishing leadership"
            );
            self.state = RaftState::Follower;
        }
        self.leader_id = None;
    }

    /// Follow in `term`, forgetting vote and leader.
    pub(crate) fn step_down(&mut self, term: Term) {
        self.current_term = term;
        self.state = RaftState::Follower;
        self.voted_for = None;
        self.leader_id = None;
    }

    /// Log entries changed since the previous call, for persistence.
    pub fn take_log_changes(&mut self) -> Option<LogChanges> {
        let from = self.dirty_from.take()?;
        Some(LogChanges {
            truncate_from: LogIndex::new(from as u64 + 1),
            entries: self.log[std::cmp::min(from, self.log.len())..].to_vec(),
        })
    }

    fn truncate_log(&mut self, keep: usize) {
        if keep < self.log.len() {
            self.log.truncate(keep);
            self.mark_dirty(keep);
        }
        if self.last_applied.as_u64() as usize > keep {
            self.last_applied = LogIndex::new(keep as u64);
        }
    }

    fn mark_dirty(&mut self, idx: usize) {
        self.dirty_from = Some(match self.dirty_from {
            Some(current) => std::cmp::min(current, idx),
            None => idx,
        });
    }

    /// Everything from the peer's next index on, anchored at the entry before it.
    fn build_append_entries(&self, peer: PeerId) -> RaftMessage {
        let next_idx = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::new(self.log.len() as u64 + 1));

        let prev_log_index = LogIndex::new(next_idx.as_u64().saturating_sub(1));
        let prev_log_term = self
            .log_entry(prev_log_index)
            .map(|e| e.term)
            .unwrap_or(Term::new(0));

        let start = std::cmp::min(prev_log_index.as_u64() as usize, self.log.len());
        let entries = self.log[start..].to_vec();

        RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.config.local_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }
    }

    fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }

    /// Commit the newest current-term entry that a majority has stored.
    fn try_advance_commit(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }
        let mut matched: Vec<u64> = self
            .config
            .peers
            .iter()
            .map(|p| self.match_index.get(p).map_or(0, |m| m.as_u64()))
            .collect();
        matched.push(self.last_log_index().as_u64());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = LogIndex::new(matched[self.majority() - 1]);

        if quorum_index > self.commit_index
            && self.log_entry(quorum_index).map(|e| e.term) == Some(self.current_term)
        {
            tracing::trace!(
                local_id = %self.config.local_id,
                index = %quorum_index,
                "commit advanced"
            );
            self.commit_index = quorum_index;
        }
    }
}
