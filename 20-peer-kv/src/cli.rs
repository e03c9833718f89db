use std::{path::PathBuf, time::Duration};

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};

use crate::config::ClusterConfig;
use crate::node::NodeConfig;
use crate::peers::Peer;
use crate::replication::ReplicationSettings;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7001";
pub const DEFAULT_AUTH_TOKEN: &str = "peer-kv-dev-token";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a storage node that replicates writes to its peers.
    Node(NodeArgs),
    /// Send a single RPC to a node and print the result.
    Client(ClientArgs),
    /// Walk through put/get/delete across a running cluster.
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Identifier reported in metadata and status. Generated when omitted.
    #[arg(long, env = "PEER_KV_NODE_ID")]
    pub node_id: Option<String>,

    /// RPC address to bind. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<String>,

    /// Address peers know this node by, if it differs from `--listen`.
    #[arg(long)]
    pub advertise: Option<Peer>,

    /// Optional address for the HTTP endpoints.
    #[arg(long)]
    pub http: Option<String>,

    /// Peer RPC address as host:port. Repeat or comma separate.
    #[arg(long = "peer", value_delimiter = ',')]
    pub peers: Vec<Peer>,

    /// JSON file listing every node; replaces `--peer`.
    #[arg(long, conflicts_with = "peers")]
    pub cluster_config: Option<PathBuf>,

    #[arg(long, env = "PEER_KV_AUTH_TOKEN", default_value = DEFAULT_AUTH_TOKEN)]
    pub auth_token: String,

    /// API key accepted by the Authenticate RPC. Repeat or comma separate.
    #[arg(long = "api-key", env = "PEER_KV_API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    #[arg(long, default_value_t = 2000)]
    pub replicate_timeout_ms: u64,

    #[arg(long, default_value_t = 64)]
    pub max_inflight_replications: usize,
}

/// A node's settings after the cluster file (if any) has been applied.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub listen: String,
    pub http: Option<String>,
    pub config: NodeConfig,
}

impl NodeArgs {
    pub fn resolve(self) -> Result<NodePlan> {
        if self.max_inflight_replications == 0 {
            return Err(anyhow!("--max-inflight-replications must be at least 1"));
        }
        let replication = ReplicationSettings {
            call_timeout: Duration::from_millis(self.replicate_timeout_ms),
            max_in_flight: self.max_inflight_replications,
        };

        let (node_id, listen, advertise, peers) = match &self.cluster_config {
            Some(path) => {
                let node_id = self
                    .node_id
                    .ok_or_else(|| anyhow!("--node-id is required with --cluster-config"))?;
                let cluster = ClusterConfig::load(path)?;
                let (me, peers) = cluster.resolve(&node_id)?;
                let listen = self.listen.unwrap_or_else(|| me.address());
                let advertise = self.advertise.unwrap_or(me);
                (node_id, listen, Some(advertise), peers)
            }
            None => {
                let node_id = self
                    .node_id
                    .unwrap_or_else(|| format!("node-{}", nanoid::nanoid!(8)));
                let listen = self.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
                (node_id, listen, self.advertise, self.peers)
            }
        };

        Ok(NodePlan {
            listen,
            http: self.http,
            config: NodeConfig {
                node_id,
                advertise,
                peers,
                auth_token: self.auth_token,
                api_keys: self.api_keys,
                replication,
            },
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// RPC address of the node to talk to.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub server: String,

    #[arg(long, env = "PEER_KV_AUTH_TOKEN", default_value = DEFAULT_AUTH_TOKEN)]
    pub token: String,

    #[command(subcommand)]
    pub action: ClientAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientAction {
    /// Exchange an API key for the cluster token.
    Authenticate { api_key: String },
    Get { key: String },
    Put {
        key: String,
        value: String,
        /// Version the caller last saw. Accepted but not enforced.
        #[arg(long, default_value_t = 0)]
        version: u64,
    },
    Delete { key: String },
    Health,
    Metadata,
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// RPC addresses of the cluster. Writes go to the first one.
    #[arg(long = "node", value_delimiter = ',', required = true)]
    pub nodes: Vec<String>,

    #[arg(long, env = "PEER_KV_AUTH_TOKEN", default_value = DEFAULT_AUTH_TOKEN)]
    pub token: String,

    /// How long to wait for replication before reading back.
    #[arg(long, default_value_t = 500)]
    pub settle_ms: u64,
}
