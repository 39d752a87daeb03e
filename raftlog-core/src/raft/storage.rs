use super::state::{PersistedState, StateSnapshot};
use parking_lot::Mutex;
use raftlog_common::error::Result;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Durable home of the persistent part of a node's state.
pub trait Storage: Send + Sync {
    /// Store a complete snapshot, replacing whatever was stored before.
    fn persist(&self, state: &StateSnapshot<'_>) -> Result<()>;

    /// Read back the last snapshot, if one was ever stored.
    fn retrieve(&self) -> Result<Option<PersistedState>>;
}

/// Keeps the encoded state in memory; clones share the same slot, which lets
/// a restarted node pick up where its predecessor stopped.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl Storage for MemoryStorage {
    fn persist(&self, state: &StateSnapshot<'_>) -> Result<()> {
        let encoded = bincode::serialize(state)?;
        *self.slot.lock() = Some(encoded);
        Ok(())
    }

    fn retrieve(&self) -> Result<Option<PersistedState>> {
        match self.slot.lock().as_deref() {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }
}

/// Saves the state as a binary file.
pub struct FileStorage {
    pub path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn scratch_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Storage for FileStorage {
    fn persist(&self, state: &StateSnapshot<'_>) -> Result<()> {
        let encoded = bincode::serialize(state)?;

        // Readers only ever observe a complete file
        let scratch = self.scratch_path();
        let mut file = File::create(&scratch)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&scratch, &self.path)?;

        debug!(path = %self.path.display(), bytes = encoded.len(), "persisted state");
        Ok(())
    }

    fn retrieve(&self) -> Result<Option<PersistedState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(bincode::deserialize(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state::State;
    use tempfile::tempdir;

    fn sample_state() -> State {
        let mut state = State::new("a", &["b".to_string()]);
        state.current_term = 4;
        state.voted_for.insert(4, "b".into());
        state.log.append(3, "x");
        state.log.append(4, "y");
        state.commit_index = 1;
        state.last_applied = 1;
        state.log_reduction = true;
        state
    }

    fn assert_restored(state: &State, restored: PersistedState) {
        assert_eq!(restored.current_term, state.current_term);
        assert_eq!(restored.voted_for, state.voted_for);
        assert_eq!(restored.log, state.log);
        assert_eq!(restored.commit_index, 1);
        assert_eq!(restored.last_applied, 1);
        assert_eq!(restored.cluster_applied, state.cluster_applied);
        assert!(restored.log_reduction);
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileStorage::new(dir.path().join("state.bin"));
        assert!(store.retrieve().unwrap().is_none());

        let state = sample_state();
        store.persist(&state.snapshot()).unwrap();

        assert_restored(&state, store.retrieve().unwrap().unwrap());
        assert!(!store.scratch_path().exists());
    }

    #[test]
    fn test_file_storage_overwrites() {
        let dir = tempdir().unwrap();
        let store = FileStorage::new(dir.path().join("state.bin"));

        let mut state = sample_state();
        store.persist(&state.snapshot()).unwrap();
        state.current_term = 9;
        store.persist(&state.snapshot()).unwrap();

        assert_eq!(store.retrieve().unwrap().unwrap().current_term, 9);
    }

    #[test]
    fn test_file_storage_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();

        assert!(FileStorage::new(path).retrieve().is_err());
    }

    #[test]
    fn test_memory_storage_is_shared_between_clones() {
        let store = MemoryStorage::new();
        let other = store.clone();
        assert!(other.is_empty());

        let state = sample_state();
        store.persist(&state.snapshot()).unwrap();

        assert_restored(&state, other.retrieve().unwrap().unwrap());
    }
}
