use crate::types::LogIndex;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of indexes each timestamp table remembers.
pub const HISTORY: usize = 1000;

/// Per-index timestamps of when entries were appended, committed and applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    appended: BTreeMap<LogIndex, DateTime<Utc>>,
    committed: BTreeMap<LogIndex, DateTime<Utc>>,
    applied: BTreeMap<LogIndex, DateTime<Utc>>,
}

fn record(table: &mut BTreeMap<LogIndex, DateTime<Utc>>, index: LogIndex, at: DateTime<Utc>) {
    table.insert(index, at);
    while table.len() > HISTORY {
        table.pop_first();
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_append_timestamp(&mut self, index: LogIndex, at: DateTime<Utc>) {
        record(&mut self.appended, index, at);
    }

    pub fn set_committed_timestamp(&mut self, index: LogIndex, at: DateTime<Utc>) {
        record(&mut self.committed, index, at);
    }

    pub fn set_applied_timestamp(&mut self, index: LogIndex, at: DateTime<Utc>) {
        record(&mut self.applied, index, at);
    }

    pub fn appended_at(&self, index: LogIndex) -> Option<DateTime<Utc>> {
        self.appended.get(&index).copied()
    }

    pub fn committed_at(&self, index: LogIndex) -> Option<DateTime<Utc>> {
        self.committed.get(&index).copied()
    }

    pub fn applied_at(&self, index: LogIndex) -> Option<DateTime<Utc>> {
        self.applied.get(&index).copied()
    }

    /// Time between an entry being appended on the leader and being committed.
    pub fn commit_latency(&self, index: LogIndex) -> Option<Duration> {
        Some(self.committed_at(index)? - self.appended_at(index)?)
    }

    /// Time between an entry being committed and being applied locally.
    pub fn apply_latency(&self, index: LogIndex) -> Option<Duration> {
        Some(self.applied_at(index)? - self.committed_at(index)?)
    }

    /// Commit latency of the most recent index that has both timestamps.
    pub fn last_commit_latency(&self) -> Option<Duration> {
        self.committed
            .keys()
            .rev()
            .find_map(|&index| self.commit_latency(index))
    }
}
