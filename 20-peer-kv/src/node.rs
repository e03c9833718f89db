//! Wiring for one running node: service, RPC server and optional HTTP adapter.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::info;

use crate::auth::Authenticator;
use crate::http;
use crate::peers::{Peer, PeerRegistry};
use crate::replication::{PeerTransport, ReplicationSettings, Replicator, TcpTransport};
use crate::server::RpcServer;
use crate::service::NodeService;

/// Everything a node needs besides its sockets.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Address peers use to reach this node. Defaults to the bound RPC address.
    pub advertise: Option<Peer>,
    /// Cluster peers; may include this node, which is filtered out.
    pub peers: Vec<Peer>,
    pub auth_token: String,
    pub api_keys: Vec<String>,
    pub replication: ReplicationSettings,
}

/// Handle to a node running on the current tokio runtime.
pub struct NodeHandle {
    pub rpc_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    service: Arc<NodeService>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl NodeHandle {
    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    /// Stops accepting connections and waits for both servers to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            task.await.context("server task panicked")??;
        }
        Ok(())
    }
}

/// Binds the RPC (and optionally HTTP) address, then starts the node.
pub async fn bind_and_spawn(
    listen: &str,
    http_listen: Option<&str>,
    config: NodeConfig,
) -> Result<NodeHandle> {
    let rpc_listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind rpc address {listen}"))?;
    let http_listener = match http_listen {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind http address {addr}"))?,
        ),
        None => None,
    };
    spawn_node(config, rpc_listener, http_listener, Arc::new(TcpTransport))
}

/// Starts a node on already-bound listeners.
///
/// Taking listeners lets callers learn every address (port 0 included)
/// before any node needs its peer list.
pub fn spawn_node(
    config: NodeConfig,
    rpc_listener: TcpListener,
    http_listener: Option<TcpListener>,
    transport: Arc<dyn PeerTransport>,
) -> Result<NodeHandle> {
    if config.node_id.trim().is_empty() {
        return Err(anyhow!("node id must not be empty"));
    }

    let rpc_addr = rpc_listener.local_addr()?;
    let http_addr = http_listener
        .as_ref()
        .map(TcpListener::local_addr)
        .transpose()?;
    let local = config.advertise.clone().unwrap_or_else(|| Peer::from(rpc_addr));

    let registry = PeerRegistry::new(&local, config.peers);
    let peer_count = registry.count();
    let replicator = Replicator::new(registry, transport, config.replication);
    let auth = Authenticator::new(config.auth_token, config.api_keys);
    let service = Arc::new(NodeService::new(
        config.node_id,
        local.clone(),
        auth,
        replicator,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    info!("rpc listening on {}", rpc_addr);
    let server = RpcServer::new(rpc_listener, Arc::clone(&service));
    tasks.push(tokio::spawn(server.run_until(wait_for_shutdown(shutdown_rx.clone()))));

    if let (Some(listener), Some(addr)) = (http_listener, http_addr) {
        info!("http listening on {}", addr);
        let app = http::router(Arc::clone(&service));
        let signal = wait_for_shutdown(shutdown_rx);
        tasks.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
                .context("http server failed")
        }));
    }

    info!(
        node_id = %service.node_id(),
        advertise = %local,
        peers = peer_count,
        "node started"
    );

    Ok(NodeHandle {
        rpc_addr,
        http_addr,
        service,
        shutdown_tx,
        tasks,
    })
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown.
    let _ = rx.wait_for(|stop| *stop).await;
}
