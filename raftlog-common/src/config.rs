use crate::error::{RaftError, Result};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Loads a cluster configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    validate(&config)?;
    Ok(config)
}

/// Rejects configurations no node could run with.
pub fn validate(config: &ClusterConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(RaftError::Config("cluster has no nodes".into()));
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if !seen.insert(node.node_id.as_str()) {
            return Err(RaftError::Config(format!(
                "duplicate node id {}",
                node.node_id
            )));
        }
    }

    if config.heartbeat_interval_ms == 0 || config.election_timeout_ms == 0 || config.vote_timeout_ms == 0 {
        return Err(RaftError::Config("timeouts must be non-zero".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "nodes": [
                    {{"host": "127.0.0.1", "port": 7001, "node_id": "a"}},
                    {{"host": "127.0.0.1", "port": 7002, "node_id": "b", "mode": "passive"}}
                ],
                "heartbeat_interval_ms": 50,
                "log_reduction": true
            }}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.node_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert!(config.log_reduction);
    }

    #[test]
    fn test_duplicate_node_ids_are_rejected() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"nodes": [
                {"host": "h", "port": 1, "node_id": "a"},
                {"host": "h", "port": 2, "node_id": "a"}
            ]}"#,
        )
        .unwrap();

        assert!(matches!(validate(&config), Err(RaftError::Config(_))));
    }
}
