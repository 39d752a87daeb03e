use crate::types::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),

    #[error("Log index {index} is out of range (offset={offset}, head={head})")]
    OutOfRange {
        index: LogIndex,
        offset: LogIndex,
        head: LogIndex,
    },

    #[error("Transport Error ({peer}): {reason}")]
    Transport { peer: NodeId, reason: String },

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Node is not active")]
    Inactive,
}

pub type Result<T> = std::result::Result<T, RaftError>;

impl RaftError {
    pub fn transport(peer: impl Into<NodeId>, reason: impl ToString) -> Self {
        RaftError::Transport {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}
