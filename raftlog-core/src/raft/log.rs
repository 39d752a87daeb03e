use bytes::Bytes;
use raftlog_common::error::{RaftError, Result};
use raftlog_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A client command for the host state machine.
    #[default]
    Command,
    /// Appended by a new leader to commit the entries of earlier terms.
    Noop,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,      // Term number when entry was received by leader
    pub index: LogIndex, // Index of the log entry in the log
    #[serde(default)]
    pub kind: EntryKind, // Noop entries never reach the state machine
    pub value: Bytes,    // Command handed to the host state machine
}

/// Returned by `head` and `tail` when no entry is retained.
pub static EMPTY: LogEntry = LogEntry {
    term: 0,
    index: 0,
    kind: EntryKind::Command,
    value: Bytes::new(),
};

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, value: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            value: value.into(),
        }
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            value: Bytes::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == EntryKind::Noop
    }
}

/// Index-addressed log with a movable compaction offset.
///
/// Entries with an index at or below `offset` have been compacted away; the
/// retained entries are contiguous and run from `offset + 1` to `index()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    offset: LogIndex,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries, which must be contiguous.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        let offset = entries.first().map_or(0, |e| e.index.saturating_sub(1));
        for (expected, entry) in (offset + 1..).zip(&entries) {
            if entry.index != expected {
                return Err(RaftError::Consensus(format!(
                    "log entries are not contiguous: expected index {} found {}",
                    expected, entry.index
                )));
            }
        }

        Ok(Self {
            entries: entries.into(),
            offset,
        })
    }

    /// Index of the most recent entry (the log head), or the offset if nothing is retained.
    pub fn index(&self) -> LogIndex {
        self.offset + self.entries.len() as LogIndex
    }

    /// Index of the last entry removed from the front of the log.
    pub fn offset(&self) -> LogIndex {
        self.offset
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new entry at the head and return its index.
    pub fn append(&mut self, term: Term, value: impl Into<Bytes>) -> LogIndex {
        let index = self.index() + 1;
        self.entries.push_back(LogEntry::new(term, index, value));
        index
    }

    /// Append a no-op entry at the head and return its index.
    pub fn append_noop(&mut self, term: Term) -> LogIndex {
        let index = self.index() + 1;
        self.entries.push_back(LogEntry::noop(term, index));
        index
    }

    /// Append a copy of `entry`, renumbered to follow the current head.
    pub fn append_copy(&mut self, entry: &LogEntry) -> LogIndex {
        let index = self.index() + 1;
        self.entries.push_back(LogEntry { index, ..entry.clone() });
        index
    }

    pub fn contains(&self, index: LogIndex) -> bool {
        self.offset < index && index <= self.index()
    }

    /// Get a specific log entry by Raft log index.
    pub fn get(&self, index: LogIndex) -> Result<&LogEntry> {
        if !self.contains(index) {
            return Err(RaftError::OutOfRange {
                index,
                offset: self.offset,
                head: self.index(),
            });
        }
        Ok(&self.entries[self.position(index)])
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).ok().map(|e| e.term)
    }

    /// True when the entry at `index` is retained and was written in `term`.
    pub fn is_consistent(&self, index: LogIndex, term: Term) -> bool {
        self.get(index).map_or(false, |e| e.term == term)
    }

    /// Entries from `from` onward, optionally capped at `size`.
    pub fn slice(&self, from: LogIndex, size: Option<usize>) -> Vec<LogEntry> {
        let from = from.max(self.offset + 1);
        if from > self.index() {
            return Vec::new();
        }

        let start = self.position(from);
        let take = size.unwrap_or(usize::MAX);
        self.entries.iter().skip(start).take(take).cloned().collect()
    }

    /// A bounded batch for replication starting at `from`.
    ///
    /// At least one entry is returned whenever one is available; after that
    /// the batch stops at whichever of `max_count` or `max_bytes` is hit first.
    pub fn chunk(&self, from: LogIndex, max_count: usize, max_bytes: u64) -> Vec<LogEntry> {
        let from = from.max(self.offset + 1);
        if from > self.index() {
            return Vec::new();
        }

        let mut chunk = Vec::new();
        let mut bytes = 0u64;
        for entry in self.entries.iter().skip(self.position(from)) {
            let size = bincode::serialized_size(entry).unwrap_or(u64::MAX);
            if !chunk.is_empty() && (chunk.len() >= max_count || bytes.saturating_add(size) > max_bytes) {
                break;
            }
            bytes = bytes.saturating_add(size);
            chunk.push(entry.clone());
        }
        chunk
    }

    /// Compact the log by discarding every entry with an index below `index`.
    ///
    /// Reducing past the head leaves an empty log with `offset == index()`.
    pub fn reduce(&mut self, index: LogIndex) -> bool {
        if index > self.index() {
            let changed = !self.entries.is_empty() || self.offset != index;
            self.entries.clear();
            self.offset = index;
            return changed;
        }

        if index <= self.offset + 1 {
            return false;
        }

        let discard = (index - 1 - self.offset) as usize;
        self.entries.drain(..discard);
        self.offset = index - 1;
        true
    }

    /// Discard every entry with an index above `index`.
    ///
    /// Rewinding to or below the offset drops the whole log and resets the
    /// offset to `index`.
    pub fn rewind(&mut self, index: LogIndex) -> bool {
        if index <= self.offset {
            let changed = !self.entries.is_empty() || self.offset != index;
            self.entries.clear();
            self.offset = index;
            return changed;
        }

        if index >= self.index() {
            return false;
        }

        self.entries.truncate((index - self.offset) as usize);
        true
    }

    /// Most recent retained entry.
    pub fn head(&self) -> &LogEntry {
        self.entries.back().unwrap_or(&EMPTY)
    }

    /// Least recent retained entry.
    pub fn tail(&self) -> &LogEntry {
        self.entries.front().unwrap_or(&EMPTY)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    fn position(&self, index: LogIndex) -> usize {
        (index - self.offset - 1) as usize
    }
}
