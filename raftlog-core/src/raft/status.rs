use super::state::Role;
use chrono::{DateTime, Utc};
use raftlog_common::types::{has_majority, LogIndex, NodeId, NodeMode, Term};
use serde::Serialize;
use std::collections::BTreeMap;

/// Applied index lag, or retained log length under reduction, above which a node turns yellow.
pub const YELLOW_THRESHOLD: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerStatus {
    pub connected: bool,
    pub synchronised: bool,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub applied: LogIndex,
    pub last_heard: Option<DateTime<Utc>>,
}

/// Point-in-time view of a node for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub name: NodeId,
    pub mode: NodeMode,
    pub role: Role,
    pub term: Term,
    pub active: bool,
    pub leader: Option<NodeId>,
    pub request_address: Option<String>,
    pub leadership_required: bool,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_offset: LogIndex,
    pub log_index: LogIndex,
    pub log_reduction: bool,
    pub commit_latency_ms: Option<i64>,
    pub peers: BTreeMap<NodeId, PeerStatus>,
    pub health: Health,
}

impl Status {
    /// Grade the node: red without a leader or, when leading, without a
    /// majority; yellow while degraded.
    pub fn assess(&self) -> Health {
        let connected = self.peers.values().filter(|p| p.connected).count();
        let is_leader = self.role == Role::Leader;

        if !self.active || self.leader.is_none() {
            return Health::Red;
        }
        if is_leader && !has_majority(connected + 1, self.peers.len() + 1) {
            return Health::Red;
        }
        if is_leader && connected != self.peers.len() {
            return Health::Yellow;
        }
        if self.commit_index.saturating_sub(self.last_applied) > YELLOW_THRESHOLD {
            return Health::Yellow;
        }
        if self.log_reduction && self.log_index - self.log_offset > YELLOW_THRESHOLD {
            return Health::Yellow;
        }
        Health::Green
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(connected: bool) -> PeerStatus {
        PeerStatus {
            connected,
            synchronised: connected,
            next_index: 1,
            match_index: 0,
            applied: 0,
            last_heard: None,
        }
    }

    fn leader_status(connected: &[bool]) -> Status {
        Status {
            name: "a".into(),
            mode: NodeMode::Active,
            role: Role::Leader,
            term: 1,
            active: true,
            leader: Some("a".into()),
            request_address: None,
            leadership_required: true,
            commit_index: 0,
            last_applied: 0,
            log_offset: 0,
            log_index: 0,
            log_reduction: false,
            commit_latency_ms: None,
            peers: connected
                .iter()
                .enumerate()
                .map(|(i, c)| (format!("p{}", i), peer(*c)))
                .collect(),
            health: Health::Red,
        }
    }

    #[test]
    fn test_fully_connected_leader_is_green() {
        assert_eq!(leader_status(&[true, true]).assess(), Health::Green);
    }

    #[test]
    fn test_leader_missing_a_peer_is_yellow() {
        assert_eq!(leader_status(&[true, false]).assess(), Health::Yellow);
    }

    #[test]
    fn test_leader_without_majority_is_red() {
        assert_eq!(leader_status(&[false, false]).assess(), Health::Red);
    }

    #[test]
    fn test_no_leader_is_red() {
        let mut status = leader_status(&[true, true]);
        status.role = Role::Follower;
        status.leader = None;
        assert_eq!(status.assess(), Health::Red);

        status.leader = Some("p0".into());
        assert_eq!(status.assess(), Health::Green);

        status.active = false;
        assert_eq!(status.assess(), Health::Red);
    }

    #[test]
    fn test_apply_lag_is_yellow() {
        let mut status = leader_status(&[true, true]);
        status.log_index = 700;
        status.commit_index = 700;
        status.last_applied = 100;
        assert_eq!(status.assess(), Health::Yellow);
    }

    #[test]
    fn test_large_log_under_reduction_is_yellow() {
        let mut status = leader_status(&[true, true]);
        status.log_index = 800;
        status.commit_index = 800;
        status.last_applied = 800;
        assert_eq!(status.assess(), Health::Green);

        status.log_reduction = true;
        assert_eq!(status.assess(), Health::Yellow);
    }

    #[test]
    fn test_serializes_lowercase_health() {
        let json = serde_json::to_value(leader_status(&[true])).unwrap();
        assert_eq!(json["health"], "red");
        assert_eq!(json["role"], "leader");
    }
}
