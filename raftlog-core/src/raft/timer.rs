use super::state::Role;
use raftlog_common::types::NodeId;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-peer deadlines driving heartbeats, vote retries and election timeouts.
#[derive(Debug, Clone)]
pub struct Timers {
    heartbeat: Duration,
    election: Duration,
    vote: Duration,
    time_outs: HashMap<NodeId, Instant>,
    back_offs: HashMap<NodeId, Instant>,
}

impl Timers {
    pub fn new(peers: &[NodeId], heartbeat: Duration, election: Duration, vote: Duration) -> Self {
        let now = Instant::now();
        Self {
            heartbeat,
            election,
            vote,
            time_outs: peers.iter().map(|p| (p.clone(), now)).collect(),
            back_offs: peers.iter().map(|p| (p.clone(), now)).collect(),
        }
    }

    /// Deadline following `prev` for a node acting as `role`.
    ///
    /// Leaders keep a fixed heartbeat cadence anchored at `prev`. Candidates
    /// and followers that may need to lead wait a random span between one
    /// and two timeouts; the others always wait the full two. A deadline
    /// never moves backwards.
    pub fn next_timeout(&self, role: Role, leadership_required: bool, prev: Instant, now: Instant) -> Instant {
        match role {
            Role::Leader => {
                if prev > now {
                    return prev + self.heartbeat;
                }
                let missed = (now - prev).as_nanos() / self.heartbeat.as_nanos().max(1);
                let beats = u32::try_from(missed + 1).unwrap_or(u32::MAX);
                prev + self.heartbeat.saturating_mul(beats)
            }
            Role::Candidate if leadership_required => prev.max(now + randomised(self.vote)),
            Role::Candidate => prev.max(now + self.vote * 2),
            Role::Follower if leadership_required => prev.max(now + randomised(self.election)),
            Role::Follower => prev.max(now + self.election * 2),
        }
    }

    /// Push the deadline of `peer` to its next value.
    pub fn extend(&mut self, peer: &str, role: Role, leadership_required: bool) {
        let now = Instant::now();
        let prev = self.deadline(peer).unwrap_or(now);
        let next = self.next_timeout(role, leadership_required, prev, now);
        self.time_outs.insert(peer.to_string(), next);
    }

    /// Move every peer to one shared deadline following the latest current one.
    pub fn extend_all(&mut self, role: Role, leadership_required: bool) {
        let now = Instant::now();
        let prev = self.time_outs.values().max().copied().unwrap_or(now);
        let next = self.next_timeout(role, leadership_required, prev, now);
        for deadline in self.time_outs.values_mut() {
            *deadline = next;
        }
    }

    /// Make every peer due right away.
    pub fn reset(&mut self) {
        let now = Instant::now();
        for deadline in self.time_outs.values_mut() {
            *deadline = now;
        }
        for deadline in self.back_offs.values_mut() {
            *deadline = now;
        }
    }

    /// Hold off `peer` until its current deadline.
    pub fn back_off(&mut self, peer: &str) {
        if let Some(&deadline) = self.time_outs.get(peer) {
            self.back_offs.insert(peer.to_string(), deadline);
        }
    }

    /// Let `peer` sit out one timeout span without moving any shared deadline.
    pub fn defer(&mut self, peer: &str, role: Role, leadership_required: bool) {
        let now = Instant::now();
        let until = self.next_timeout(role, leadership_required, now, now);
        self.back_offs.insert(peer.to_string(), until);
    }

    pub fn is_backing_off(&self, peer: &str) -> bool {
        self.back_offs.get(peer).map_or(false, |&b| b > Instant::now())
    }

    pub fn deadline(&self, peer: &str) -> Option<Instant> {
        self.time_outs.get(peer).copied()
    }

    /// How long the worker for `peer` should sleep before acting again.
    ///
    /// Followers share a single election deadline, the latest of all peers.
    pub fn wait_for(&self, peer: &str, role: Role) -> Duration {
        let deadline = match role {
            Role::Follower => self.time_outs.values().max().copied(),
            _ => self.deadline(peer),
        };
        let back_off = self.back_offs.get(peer).copied();

        match deadline.max(back_off) {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// True once the deadline of `peer` passed, or of every peer when `peer` is `None`.
    pub fn has_timed_out(&self, peer: Option<&str>) -> bool {
        let deadline = match peer {
            Some(peer) => self.deadline(peer),
            None => self.time_outs.values().max().copied(),
        };
        deadline.map_or(true, |at| at <= Instant::now())
    }
}

fn randomised(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    rand::thread_rng().gen_range(base..=base * 2)
}
