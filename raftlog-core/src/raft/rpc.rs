use super::log::LogEntry;
use raftlog_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,  // True if the vote was cast for the candidate
    pub eligible: bool, // False if the candidate's log is behind the voter's
}

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_id: NodeId,                           // Leader's ID
    pub prev_log_index: LogIndex,                    // Index of log entry before new ones
    pub prev_log_term: Term,                         // Term of that entry
    pub entries: Vec<LogEntry>,                      // New log entries to store
    pub leader_commit: LogIndex,                     // Leader’s commit index
    pub request_address: Option<String>,             // Where clients should send commands
    pub log_reduction: bool,                         // Whether followers may compact their logs
    pub cluster_applied: BTreeMap<NodeId, LogIndex>, // Last applied index per node
}

/// Why a follower accepted or rejected an AppendEntries RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Appended,
    Heartbeat,
    TermOutdated,
    LogReduced,
    LogBehind,
    Inconsistent,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Reason::Appended => "Appended",
            Reason::Heartbeat => "Heartbeat",
            Reason::TermOutdated => "Sender term is outdated",
            Reason::LogReduced => "Logs have been reduced",
            Reason::LogBehind => "Log is further behind",
            Reason::Inconsistent => "Inconsistent logs",
        };
        f.write_str(reason)
    }
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub granted: bool, // True if follower accepted the request
    pub reason: Reason,
    pub last_applied: LogIndex,  // Follower's last applied index
    pub last_appended: LogIndex, // Head of the follower's log
    pub log_offset: LogIndex,    // Compaction offset of the follower's log
    pub matched: LogIndex,       // Highest index known to agree with the leader
}
