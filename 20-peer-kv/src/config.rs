use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::peers::Peer;

/// Cluster description shared by every node, e.g.
///
/// ```json
/// {"nodes": [{"id": "n1", "host": "127.0.0.1", "port": 7001},
///            {"id": "n2", "host": "127.0.0.1", "port": 7002}]}
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    pub nodes: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl ClusterNode {
    pub fn peer(&self) -> Peer {
        Peer::new(self.host.clone(), self.port)
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cluster config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid cluster config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(raw)?;
        if config.nodes.is_empty() {
            return Err(anyhow!("cluster config lists no nodes"));
        }
        for (i, node) in config.nodes.iter().enumerate() {
            if config.nodes[..i].iter().any(|other| other.id == node.id) {
                return Err(anyhow!("duplicate node id '{}'", node.id));
            }
        }
        Ok(config)
    }

    /// Splits the cluster into this node's own address and everyone else.
    pub fn resolve(&self, node_id: &str) -> Result<(Peer, Vec<Peer>)> {
        let me = self
            .nodes
            .iter()
            .find(|node| node.id == node_id)
            .ok_or_else(|| anyhow!("node id '{node_id}' is not in the cluster config"))?;
        let peers = self
            .nodes
            .iter()
            .filter(|node| node.id != node_id)
            .map(ClusterNode::peer)
            .collect();
        Ok((me.peer(), peers))
    }
}
