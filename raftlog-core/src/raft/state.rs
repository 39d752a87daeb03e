use super::log::RaftLog;
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, Reason, VoteRequest, VoteResponse};
use bytes::Bytes;
use chrono::Utc;
use raftlog_common::metrics::Statistics;
use raftlog_common::types::{has_majority, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Maximum number of entries to send in a single append entries RPC.
pub const CHUNK_SIZE: usize = 1000;
/// Maximum number of bytes the entries of a single append entries RPC may sum to.
pub const MAX_CHUNK_BYTES: u64 = 1024 * 1024;

/// Possible roles a Raft node can assume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// What the owning node has to do after a state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    /// The persistent part of the state changed.
    pub persist: bool,
    /// The commit index advanced; the apply loop should run.
    pub apply: bool,
    /// This node just won an election.
    pub elected: bool,
    /// A voter reported our log as behind, so we stepped down.
    pub stepped_down: bool,
    /// Reconciliation with the peer stalled; stop retrying until its next deadline.
    pub back_off: bool,
    /// Whether the peer's log now agrees with ours.
    pub synchronised: Option<bool>,
}

/// A single retained entry used to reset a node out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_term: Term,
    pub last_index: LogIndex,
    pub last_value: Bytes,
}

/// Borrowed view of everything that survives a restart.
#[derive(Debug, Serialize)]
pub struct StateSnapshot<'a> {
    pub current_term: Term,
    pub voted_for: &'a BTreeMap<Term, NodeId>,
    pub log: &'a RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub cluster_applied: &'a BTreeMap<NodeId, LogIndex>,
    pub log_reduction: bool,
}

/// Owned counterpart of [`StateSnapshot`], produced when reading it back.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersistedState {
    pub current_term: Term,
    pub voted_for: BTreeMap<Term, NodeId>,
    pub log: RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub cluster_applied: BTreeMap<NodeId, LogIndex>,
    pub log_reduction: bool,
}

/// The Raft state of one node.
///
/// Handlers never touch storage, timers or the network: they mutate the
/// state and report what the node has to do through [`Effects`].
#[derive(Debug, Clone)]
pub struct State {
    name: NodeId,
    role: Role,
    neighbourhood: usize,

    // Persistent state on all nodes
    pub current_term: Term,
    pub voted_for: BTreeMap<Term, NodeId>,
    pub log: RaftLog,

    // Volatile state on all nodes
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub cluster_applied: BTreeMap<NodeId, LogIndex>,
    pub log_reduction: bool,

    // Volatile state on leaders
    pub next_index: BTreeMap<NodeId, LogIndex>,
    pub match_index: BTreeMap<NodeId, LogIndex>,

    // Volatile state on candidates
    pub votes: BTreeMap<NodeId, bool>,

    pub statistics: Statistics,
}

impl State {
    /// Create the state of `name`; `neighbours` must not contain `name`.
    pub fn new(name: impl Into<NodeId>, neighbours: &[NodeId]) -> Self {
        let name = name.into();
        let mut cluster_applied: BTreeMap<NodeId, LogIndex> =
            neighbours.iter().map(|n| (n.clone(), 0)).collect();
        cluster_applied.insert(name.clone(), 0);

        Self {
            role: Role::Follower,
            neighbourhood: neighbours.len() + 1,
            current_term: 0,
            voted_for: BTreeMap::new(),
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            cluster_applied,
            log_reduction: false,
            next_index: neighbours.iter().map(|n| (n.clone(), 1)).collect(),
            match_index: neighbours.iter().map(|n| (n.clone(), 0)).collect(),
            votes: BTreeMap::new(),
            statistics: Statistics::new(),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Assign a new role, applying its entry side effects.
    ///
    /// Becoming a candidate starts a new term with a vote for ourselves;
    /// becoming leader points every follower just past our log head.
    pub fn set_role(&mut self, role: Role) {
        if self.role == role {
            return;
        }

        self.role = role;
        match role {
            Role::Candidate => {
                self.current_term += 1;
                self.voted_for = BTreeMap::from([(self.current_term, self.name.clone())]);
                self.votes = BTreeMap::from([(self.name.clone(), true)]);
            }
            Role::Leader => {
                let next = self.log.index() + 1;
                for index in self.next_index.values_mut() {
                    *index = next;
                }
                for index in self.match_index.values_mut() {
                    *index = 0;
                }
            }
            Role::Follower => {}
        }
    }

    /// Take leadership and append a no-op for the new term.
    ///
    /// Only current-term entries are counted towards commitment, so entries
    /// inherited from earlier terms commit once the no-op does.
    pub fn become_leader(&mut self) -> LogIndex {
        self.set_role(Role::Leader);
        let index = self.log.append_noop(self.current_term);
        self.statistics.set_append_timestamp(index, Utc::now());
        self.advance_commit();
        index
    }

    /// Adopt a newer term seen on the wire, demoting ourselves if needed.
    pub fn adopt_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }

        self.current_term = term;
        self.role = Role::Follower;
        true
    }

    /// `count` nodes form a majority of the neighbourhood.
    pub fn has_majority(&self, count: usize) -> bool {
        has_majority(count, self.neighbourhood)
    }

    pub fn neighbourhood(&self) -> usize {
        self.neighbourhood
    }

    pub fn snapshot(&self) -> StateSnapshot<'_> {
        StateSnapshot {
            current_term: self.current_term,
            voted_for: &self.voted_for,
            log: &self.log,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            cluster_applied: &self.cluster_applied,
            log_reduction: self.log_reduction,
        }
    }

    /// Restore persisted fields, keeping this node's identity and peer set.
    pub fn populate(&mut self, from: PersistedState) {
        self.current_term = from.current_term;
        self.voted_for = from.voted_for;
        self.log = from.log;
        self.commit_index = from.commit_index.min(self.log.index());
        self.last_applied = from.last_applied.min(self.commit_index);
        self.cluster_applied.extend(from.cluster_applied);
        self.log_reduction = from.log_reduction;

        let next = self.log.index() + 1;
        for index in self.next_index.values_mut() {
            *index = next;
        }
    }

    /// Start a new election round unless this peer has yet to answer the current one.
    pub fn increment_term(&mut self, neighbour: &str) -> bool {
        let voted_for_self = self.voted_for.get(&self.current_term) == Some(&self.name);
        if self.votes.contains_key(neighbour) || !voted_for_self {
            self.current_term += 1;
            self.voted_for = BTreeMap::from([(self.current_term, self.name.clone())]);
            self.votes = BTreeMap::from([(self.name.clone(), true)]);
            return true;
        }
        false
    }

    /// The neighbour is missing entries or has not confirmed our commit index.
    pub fn missing_entries(&self, neighbour: &str) -> bool {
        if self.role != Role::Leader {
            return false;
        }

        let next = self.next_index.get(neighbour).copied().unwrap_or(1);
        let matched = self.match_index.get(neighbour).copied().unwrap_or(0);
        next <= self.log.index() || matched < self.commit_index
    }

    /// Lowest next index we can still serve with a verifiable previous entry.
    fn first_sendable_index(&self) -> LogIndex {
        match self.log.offset() {
            0 => 1,
            offset => offset + 2,
        }
    }

    fn reduce_log(&mut self) -> bool {
        if !self.log_reduction || self.log.len() <= 1 {
            return false;
        }

        let slowest = self.cluster_applied.values().copied().min().unwrap_or(0);
        let target = slowest.saturating_sub(1).min(self.last_applied);
        if self.log.reduce(target) {
            debug!(node = %self.name, retained = self.log.len(), offset = self.log.offset(), "reduced log");
            return true;
        }
        false
    }

    /// Advance the commit index to the highest current-term index a majority holds.
    fn advance_commit(&mut self) -> bool {
        let head = self.log.index();
        let mut candidates: Vec<LogIndex> = self.match_index.values().copied().collect();
        candidates.push(head);
        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates.dedup();

        for index in candidates {
            if index <= self.commit_index {
                break;
            }
            if self.log.term_at(index) != Some(self.current_term) {
                continue;
            }

            let count = 1 + self.match_index.values().filter(|&&m| m >= index).count();
            if self.has_majority(count) {
                info!(node = %self.name, term = self.current_term, index, "committed log");
                self.commit_index = index;
                self.statistics.set_committed_timestamp(index, Utc::now());
                return true;
            }
        }
        false
    }

    pub fn on_vote_request(&mut self, term: Term, req: &VoteRequest) -> (VoteResponse, Effects) {
        let mut effects = Effects::default();

        // The candidate's log must be at least as up to date as ours
        let own_term = self.log.head().term;
        let eligible = req.last_log_term > own_term
            || (req.last_log_term == own_term && self.log.index() <= req.last_log_index);
        info!(node = %self.name, candidate = %req.candidate_id, eligible, "vote request received");

        if term < self.current_term {
            return (VoteResponse { granted: false, eligible }, effects);
        }

        let granted = match self.voted_for.get(&self.current_term) {
            Some(vote) => vote == &req.candidate_id,
            None if eligible => {
                info!(node = %self.name, term = self.current_term, candidate = %req.candidate_id, "casting vote");
                self.voted_for = BTreeMap::from([(self.current_term, req.candidate_id.clone())]);
                effects.persist = true;
                true
            }
            None => false,
        };

        (VoteResponse { granted, eligible }, effects)
    }

    pub fn on_vote_response(&mut self, voter: &str, term: Term, resp: &VoteResponse) -> Effects {
        let mut effects = Effects::default();
        if self.role != Role::Candidate || term != self.current_term {
            return effects;
        }

        debug!(node = %self.name, voter, granted = resp.granted, "received vote");
        self.votes.insert(voter.to_string(), resp.granted);

        let granted = self.votes.values().filter(|&&v| v).count();
        if self.has_majority(granted) {
            info!(node = %self.name, term = self.current_term, head = self.log.index(), "converting to leader");
            self.become_leader();
            effects.elected = true;
            effects.persist = true;
        } else if !resp.eligible {
            warn!(node = %self.name, voter, "not eligible, stepping down");
            self.role = Role::Follower;
            effects.stepped_down = true;
        }
        effects
    }

    pub fn on_append_entries(&mut self, term: Term, req: &AppendEntriesRequest) -> (AppendEntriesResponse, Effects) {
        let mut effects = Effects::default();
        let prev_index = req.prev_log_index;
        let prev_term = req.prev_log_term;

        if term < self.current_term {
            info!(node = %self.name, term, current = self.current_term, "sender term is outdated");
            return (self.append_response(false, Reason::TermOutdated, 0), effects);
        }
        self.role = Role::Follower;

        // Data the leader assumes present has already been compacted away
        if self.log.offset() > 0 && self.log.tail().index.saturating_sub(1) > prev_index {
            warn!(node = %self.name, tail = self.log.tail().index, prev_index, "logs have been reduced");
            return (self.append_response(false, Reason::LogReduced, 0), effects);
        }

        if self.log.index() < prev_index {
            info!(node = %self.name, head = self.log.index(), prev_index, "log is further behind");
            return (self.append_response(false, Reason::LogBehind, 0), effects);
        }

        if prev_index > 0 && !self.log.is_consistent(prev_index, prev_term) {
            warn!(
                node = %self.name,
                prev_index,
                prev_term,
                found = ?self.log.term_at(prev_index),
                "inconsistent logs"
            );
            // Committed entries are never discarded
            if self.log.tail().index <= prev_index && prev_index > self.commit_index {
                effects.persist |= self.log.rewind(prev_index - 1);
            }
            return (self.append_response(false, Reason::Inconsistent, 0), effects);
        }

        let mut matched = prev_index;
        for (index, entry) in (prev_index + 1..).zip(&req.entries) {
            if let Ok(existing) = self.log.get(index) {
                if existing.term != entry.term {
                    if index <= self.commit_index {
                        warn!(node = %self.name, index, "refusing to overwrite a committed entry");
                        break;
                    }
                    warn!(node = %self.name, index, ours = existing.term, theirs = entry.term, "conflicting entry, rewinding");
                    self.log.rewind(index - 1);
                }
            }

            if self.log.index() + 1 == index {
                debug!(node = %self.name, index, term = entry.term, "appending entry");
                self.log.append_copy(entry);
            } else if self.log.index() < index {
                break;
            }
            matched = index;
        }
        let matched = matched.min(self.log.index());

        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(matched);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.statistics.set_committed_timestamp(commit, Utc::now());
                effects.apply = true;
            }
        }

        self.cluster_applied = req.cluster_applied.clone();
        self.log_reduction = req.log_reduction;
        self.reduce_log();

        effects.persist = true;
        let reason = if req.entries.is_empty() {
            Reason::Heartbeat
        } else {
            Reason::Appended
        };
        (self.append_response(true, reason, matched), effects)
    }

    pub fn on_append_response(&mut self, follower: &str, resp: &AppendEntriesResponse) -> Effects {
        let mut effects = Effects::default();
        if self.role != Role::Leader {
            return effects;
        }

        effects.synchronised = Some(resp.granted);
        if !resp.granted {
            if self.log.head().index > 0 {
                let current = self.next_index.get(follower).copied().unwrap_or(1);

                // Step back by one, or jump to the follower's head when it is further behind
                let mut next = current.saturating_sub(1);
                if next == 0 || resp.last_appended < next {
                    next = resp.last_appended + 1;
                }

                if resp.log_offset > 0 && next <= resp.log_offset {
                    warn!(node = %self.name, follower, next, follower_offset = resp.log_offset, "next index below follower offset");
                    next = resp.log_offset + 2;
                }

                let floor = self.first_sendable_index();
                if next < floor {
                    warn!(node = %self.name, follower, next, floor, "next index is no longer available");
                    next = floor;
                    effects.back_off = true;
                }

                let next = next.min(self.log.index() + 1);
                debug!(node = %self.name, follower, from = current, to = next, reason = %resp.reason, "next index backed off");
                self.next_index.insert(follower.to_string(), next);
            }
        } else {
            let matched = resp.matched.min(self.log.index());
            self.match_index.insert(follower.to_string(), matched);
            self.next_index.insert(follower.to_string(), matched + 1);

            if self.advance_commit() {
                effects.apply = true;
                effects.persist = true;
            }

            self.cluster_applied.insert(follower.to_string(), resp.last_applied);
        }

        effects.persist |= self.reduce_log();
        effects
    }

    /// Append a command to the log; only the leader accepts commands.
    pub fn append_log_entry(&mut self, command: impl Into<Bytes>) -> Option<LogIndex> {
        if self.role != Role::Leader {
            return None;
        }

        let index = self.log.append(self.current_term, command);
        self.statistics.set_append_timestamp(index, Utc::now());
        self.advance_commit();
        Some(index)
    }

    /// Move the apply cursor forward by one committed entry.
    pub fn apply_next(&mut self) -> Option<LogIndex> {
        if self.last_applied >= self.commit_index || !self.log.contains(self.last_applied + 1) {
            return None;
        }

        self.last_applied += 1;
        self.cluster_applied.insert(self.name.clone(), self.last_applied);
        self.statistics.set_applied_timestamp(self.last_applied, Utc::now());
        Some(self.last_applied)
    }

    pub fn vote_request(&self) -> VoteRequest {
        VoteRequest {
            candidate_id: self.name.clone(),
            last_log_index: self.log.index(),
            last_log_term: self.log.head().term,
        }
    }

    /// Build the append entries request for `recipient`.
    ///
    /// Entries are only attached once the recipient is known to be
    /// synchronised; until then the request probes for the matching prefix.
    pub fn append_entries_request(
        &mut self,
        recipient: &str,
        heartbeat: bool,
        synchronised: bool,
        request_address: Option<String>,
    ) -> AppendEntriesRequest {
        let floor = self.first_sendable_index();
        let head = self.log.index();
        let next = self
            .next_index
            .get(recipient)
            .copied()
            .unwrap_or(head + 1)
            .clamp(floor.min(head + 1), head + 1);
        self.next_index.insert(recipient.to_string(), next);

        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = if heartbeat || !synchronised {
            Vec::new()
        } else {
            self.log.chunk(next, CHUNK_SIZE, MAX_CHUNK_BYTES)
        };

        AppendEntriesRequest {
            leader_id: self.name.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
            request_address,
            log_reduction: self.log_reduction,
            cluster_applied: self.cluster_applied.clone(),
        }
    }

    fn append_response(&self, granted: bool, reason: Reason, matched: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            granted,
            reason,
            last_applied: self.last_applied,
            last_appended: self.log.index(),
            log_offset: self.log.offset(),
            matched,
        }
    }

    /// The entry at `index`, or the log tail when `index` is 0.
    pub fn checkpoint(&self, index: LogIndex) -> Option<Checkpoint> {
        let entry = if index == 0 {
            self.log.tail()
        } else {
            self.log.get(index).ok()?
        };

        Some(Checkpoint {
            last_term: entry.term,
            last_index: entry.index,
            last_value: entry.value.clone(),
        })
    }

    /// Replace the log so that it ends at `checkpoint`, which becomes committed and applied.
    pub fn set_checkpoint(&mut self, checkpoint: &Checkpoint) {
        let before = checkpoint.last_index.saturating_sub(1);
        if self.log.contains(checkpoint.last_index) || self.log.offset() > checkpoint.last_index {
            self.log.rewind(before);
        }
        if self.log.index() < before {
            self.log.reduce(before);
        }

        self.log.append(checkpoint.last_term, checkpoint.last_value.clone());
        self.commit_index = self.log.index();
        self.last_applied = self.log.index();
    }
}
