//! Shared identifiers, configuration and error types for the raftlog workspace.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
