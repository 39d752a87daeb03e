// Raft log, wire messages, consensus state and the node driving them
pub mod log;
pub mod message;
pub mod node;
pub mod rpc;
pub mod state;
pub mod state_machine;
pub mod status;
pub mod storage;
pub mod timer;
pub mod transport;
