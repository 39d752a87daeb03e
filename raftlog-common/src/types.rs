pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::fmt;

/// How willing a node is to put itself forward for leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Takes part in every vote and campaigns as soon as an election times out.
    #[default]
    Active,
    /// Takes part in every vote but never nominates itself.
    Passive,
    /// Only campaigns once no up-to-date active peer appears to be available.
    Reluctant,
}

/// Connectivity snapshot used when judging eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    /// Peers currently reachable, excluding this node.
    pub connected: usize,
    /// Size of the whole cluster, including this node.
    pub neighbourhood: usize,
}

impl Reachability {
    pub fn has_majority(&self) -> bool {
        has_majority(self.connected + 1, self.neighbourhood)
    }
}

/// `count` nodes form a majority of a cluster of `neighbourhood` nodes.
pub fn has_majority(count: usize, neighbourhood: usize) -> bool {
    count > neighbourhood / 2
}

impl NodeMode {
    /// Whether a node in this mode may seek or hold leadership.
    ///
    /// Without a `reachability` snapshot the majority requirement is not checked.
    pub fn is_eligible(self, leadership_required: bool, reachability: Option<Reachability>) -> bool {
        match self {
            NodeMode::Passive => false,
            NodeMode::Reluctant if !leadership_required => false,
            NodeMode::Active | NodeMode::Reluctant => {
                reachability.map_or(true, |r| r.has_majority())
            }
        }
    }

    /// Whether a node in this mode starts out treating leadership as required.
    pub fn requires_leadership(self) -> bool {
        self == NodeMode::Active
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMode::Active => write!(f, "active"),
            NodeMode::Passive => write!(f, "passive"),
            NodeMode::Reluctant => write!(f, "reluctant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
    #[serde(default)]
    pub mode: NodeMode,
}

impl NodeAddress {
    /// Address clients should send requests to.
    pub fn request_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_election_timeout_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    250
}

fn default_vote_timeout_ms() -> u64 {
    150
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,
    /// How long an outbound RPC waits for its reply; defaults to the election timeout.
    #[serde(default)]
    pub rpc_timeout_ms: Option<u64>,
    #[serde(default)]
    pub log_reduction: bool,
}

impl ClusterConfig {
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeAddress> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_serialization() {
        let node = NodeAddress {
            host: "127.0.0.1".into(),
            port: 8080,
            node_id: "node-1".into(),
            mode: NodeMode::Reluctant,
        };

        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"reluctant\""));
        let deserialized: NodeAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(node.node_id, deserialized.node_id);
        assert_eq!(deserialized.mode, NodeMode::Reluctant);
    }

    #[test]
    fn test_cluster_config_defaults() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"nodes": [{"host": "localhost", "port": 7001, "node_id": "a"}]}"#,
        )
        .unwrap();

        assert_eq!(config.election_timeout_ms, 500);
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.vote_timeout_ms, 150);
        assert_eq!(config.rpc_timeout_ms, None);
        assert!(!config.log_reduction);
        assert_eq!(config.nodes[0].mode, NodeMode::Active);
    }

    #[test]
    fn test_majority() {
        assert!(has_majority(2, 3));
        assert!(!has_majority(1, 3));
        assert!(has_majority(3, 5));
        assert!(!has_majority(2, 4));
        assert!(has_majority(1, 1));
    }

    #[test]
    fn test_eligibility_per_mode() {
        let reachable = Some(Reachability { connected: 2, neighbourhood: 3 });
        let cut_off = Some(Reachability { connected: 0, neighbourhood: 3 });

        assert!(!NodeMode::Passive.is_eligible(true, reachable));
        assert!(!NodeMode::Reluctant.is_eligible(false, reachable));
        assert!(NodeMode::Reluctant.is_eligible(true, reachable));
        assert!(NodeMode::Active.is_eligible(false, reachable));
        assert!(!NodeMode::Active.is_eligible(true, cut_off));
        assert!(NodeMode::Active.is_eligible(true, None));
    }
}
