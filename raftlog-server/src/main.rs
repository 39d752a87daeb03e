//! Runs a whole raftlog cluster inside one process.
//!
//! Every member of the configured cluster gets its own node, joined over an
//! in-memory network. Commands read from stdin are proposed to the leader
//! and the status of every node is printed once they have been applied.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use parking_lot::Mutex;
use raftlog_common::config::load_config;
use raftlog_core::{FileStorage, InMemoryNetwork, KeyValueStore, KvCommand, Node, Proposal};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "raftlog", version, about = "Local replicated log cluster")]
struct Cli {
    /// Path to the JSON cluster configuration.
    #[arg(short, long, default_value = "cluster.json")]
    config: PathBuf,

    /// Keep each node's state in `<dir>/<node_id>.state` instead of memory.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// How long to wait for a leader, and for each command to apply, in milliseconds.
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    info!("Loading configuration from {}", cli.config.display());
    let cluster = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let network = InMemoryNetwork::new();
    let mut nodes = Vec::new();
    let mut stores = Vec::new();
    for member in &cluster.nodes {
        let store = Arc::new(Mutex::new(KeyValueStore::default()));
        let transport = Arc::new(network.transport(member.node_id.clone()));
        let mut builder = Node::from_cluster(&cluster, &member.node_id, transport)?.state_machine(store.clone());
        if let Some(dir) = &cli.data_dir {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            builder = builder.storage(FileStorage::new(dir.join(format!("{}.state", member.node_id))));
        }

        let node = builder
            .build()
            .with_context(|| format!("failed to build node {}", member.node_id))?;
        node.activate()
            .with_context(|| format!("failed to activate node {}", member.node_id))?;
        nodes.push(node);
        stores.push(store);
    }

    let leader = wait_for_leader(&nodes, timeout)?;
    info!(leader = %leader.name(), term = leader.term(), "cluster has a leader");

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        let command = match parse_command(&line) {
            Some(command) => command,
            None => {
                if !line.trim().is_empty() {
                    warn!(%line, "expected `set <key> <value>` or `delete <key>`");
                }
                continue;
            }
        };

        let leader = wait_for_leader(&nodes, timeout)?;
        match leader.propose(command.encode()?)? {
            Proposal::Accepted(index) => {
                if !leader.wait_applied(index, timeout) {
                    warn!(index, "command was not applied in time");
                }
            }
            other => warn!(?other, "command was not accepted"),
        }
    }

    for (node, store) in nodes.iter().zip(&stores) {
        let status = serde_json::to_string_pretty(&node.status())?;
        println!("{}", status);
        info!(node = %node.name(), keys = store.lock().len(), "final store size");
    }

    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}

fn parse_command(line: &str) -> Option<KvCommand> {
    let mut words = line.split_whitespace();
    match (words.next()?, words.next(), words.next()) {
        ("set", Some(key), Some(value)) => Some(KvCommand::Set(key.to_string(), value.to_string())),
        ("delete", Some(key), None) => Some(KvCommand::Delete(key.to_string())),
        _ => None,
    }
}

fn wait_for_leader(nodes: &[Node], timeout: Duration) -> anyhow::Result<&Node> {
    if nodes.is_empty() {
        bail!("cluster has no nodes");
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(leader) = nodes.iter().find(|n| n.is_leader()) {
            return Ok(leader);
        }
        thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("no leader elected within {:?}", timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("set colour blue"),
            Some(KvCommand::Set("colour".into(), "blue".into()))
        );
        assert_eq!(parse_command("  delete colour "), Some(KvCommand::Delete("colour".into())));
        assert_eq!(parse_command("set colour"), None);
        assert_eq!(parse_command("delete a b"), None);
        assert_eq!(parse_command(""), None);
    }
}
