//! Replicated log built on Raft, with nodes that can decline leadership.

pub mod raft;

pub use raft::node::{Node, NodeBuilder, NodeConfig, Proposal};
pub use raft::state::{Checkpoint, Role};
pub use raft::state_machine::{KeyValueStore, KvCommand, StateMachine};
pub use raft::status::{Health, Status};
pub use raft::storage::{FileStorage, MemoryStorage, Storage};
pub use raft::transport::{InMemoryNetwork, InMemoryTransport, Transport};
