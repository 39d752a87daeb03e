use super::log::LogEntry;
use parking_lot::Mutex;
use raftlog_common::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Host-side consumer of committed log entries.
///
/// Entries are handed over strictly in index order, each at most once per
/// process lifetime. No-op entries are never handed over. An error is logged
/// and the entry counts as applied all the same; it is not offered again.
pub trait StateMachine: Send {
    fn apply(&mut self, entry: &LogEntry) -> Result<()>;
}

/// Discards every command.
#[derive(Debug, Default)]
pub struct NoopMachine;

impl StateMachine for NoopMachine {
    fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        trace!(index = entry.index, "discarding entry");
        Ok(())
    }
}

/// Lets the host keep a handle on the machine it gave to a node.
impl<M: StateMachine> StateMachine for Arc<Mutex<M>> {
    fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        self.lock().apply(entry)
    }
}

//
// In-memory key-value store driven by the log
//

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set(String, String),
    Delete(String),
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
    applied: u64,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Index of the last entry this store has seen.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        if entry.is_noop() {
            self.applied = entry.index;
            return Ok(());
        }

        match bincode::deserialize(&entry.value)? {
            KvCommand::Set(k, v) => {
                self.data.insert(k, v);
            }
            KvCommand::Delete(k) => {
                self.data.remove(&k);
            }
        }
        self.applied = entry.index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, command: KvCommand) -> LogEntry {
        LogEntry::new(1, index, command.encode().unwrap())
    }

    #[test]
    fn test_set_and_delete() {
        let mut kv = KeyValueStore::default();

        kv.apply(&entry(1, KvCommand::Set("foo".into(), "bar".into()))).unwrap();
        assert_eq!(kv.get("foo"), Some("bar".into()));

        kv.apply(&entry(2, KvCommand::Delete("foo".into()))).unwrap();
        assert_eq!(kv.get("foo"), None);
        assert_eq!(kv.applied(), 2);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut kv = KeyValueStore::default();
        let err = kv.apply(&LogEntry::new(1, 1, vec![0xffu8; 3]));

        assert!(err.is_err());
        assert_eq!(kv.applied(), 0);
    }

    #[test]
    fn test_noop_is_skipped() {
        let mut kv = KeyValueStore::default();
        kv.apply(&LogEntry::noop(2, 1)).unwrap();

        assert!(kv.is_empty());
        assert_eq!(kv.applied(), 1);
    }

    #[test]
    fn test_shared_machine() {
        let kv = Arc::new(Mutex::new(KeyValueStore::default()));
        let mut handle = kv.clone();

        handle.apply(&entry(1, KvCommand::Set("a".into(), "1".into()))).unwrap();
        assert_eq!(kv.lock().get("a"), Some("1".into()));
        assert_eq!(kv.lock().len(), 1);
    }
}
