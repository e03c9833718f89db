//! Multi-node tests over real TCP connections on localhost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use peer_kv::client::RpcClient;
use peer_kv::node::{NodeConfig, NodeHandle, spawn_node};
use peer_kv::peers::Peer;
use peer_kv::protocol::ReplicationMessage;
use peer_kv::replication::{ReplicationSettings, TcpTransport};
use tokio::net::TcpListener;

const TOKEN: &str = "cluster-token";
const SETTLE: Duration = Duration::from_secs(3);

struct TestCluster {
    handles: Vec<NodeHandle>,
}

impl TestCluster {
    /// Binds every listener first so each node knows the full peer list.
    async fn spawn(n: usize) -> Result<Self> {
        let mut listeners = Vec::new();
        for _ in 0..n {
            listeners.push(TcpListener::bind("127.0.0.1:0").await?);
        }
        let peers = listeners
            .iter()
            .map(|listener| listener.local_addr().map(Peer::from))
            .collect::<std::io::Result<Vec<_>>>()?;

        let mut handles = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            handles.push(spawn_node(
                config(&format!("n{}", i + 1), peers.clone()),
                listener,
                None,
                Arc::new(TcpTransport),
            )?);
        }
        Ok(Self { handles })
    }

    fn node(&self, id: usize) -> &NodeHandle {
        &self.handles[id - 1]
    }

    async fn client(&self, id: usize) -> Result<RpcClient> {
        RpcClient::connect(&self.node(id).rpc_addr.to_string()).await
    }

    async fn shutdown(self) -> Result<()> {
        for handle in self.handles {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

fn config(node_id: &str, peers: Vec<Peer>) -> NodeConfig {
    NodeConfig {
        node_id: node_id.to_string(),
        advertise: None,
        peers,
        auth_token: TOKEN.to_string(),
        api_keys: vec!["demo-key".to_string()],
        replication: ReplicationSettings {
            call_timeout: Duration::from_millis(500),
            max_in_flight: 16,
        },
    }
}

/// Polls `check` until it holds or `SETTLE` runs out.
async fn eventually<F>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !check() {
        if start.elapsed() > SETTLE {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn value_at(handle: &NodeHandle, key: &str) -> Option<String> {
    handle.service().get(key, Some(TOKEN)).ok().map(|entry| entry.value)
}

#[tokio::test]
async fn put_propagates_to_every_peer() -> Result<()> {
    let cluster = TestCluster::spawn(3).await?;

    let mut client = cluster.client(1).await?;
    let response = client.put("color", "blue", Some(TOKEN), 0).await?;
    assert!(response.success);
    assert_eq!(response.new_version, 1);

    for id in 2..=3 {
        let node = cluster.node(id);
        eventually("replicated put", || value_at(node, "color").as_deref() == Some("blue")).await?;
        let mut peer_client = cluster.client(id).await?;
        let read = peer_client.get("color", Some(TOKEN)).await?;
        assert!(read.found);
        assert_eq!(read.value, "blue");
        assert_eq!(read.version, 1);
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn delete_propagates_to_every_peer() -> Result<()> {
    let cluster = TestCluster::spawn(3).await?;

    let mut client = cluster.client(2).await?;
    client.put("session", "abc", Some(TOKEN), 0).await?;
    for id in [1, 3] {
        let node = cluster.node(id);
        eventually("replicated put", || value_at(node, "session").is_some()).await?;
    }

    let response = client.delete("session", Some(TOKEN)).await?;
    assert!(response.success);
    for id in 1..=3 {
        let node = cluster.node(id);
        eventually("replicated delete", || value_at(node, "session").is_none()).await?;
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn writes_on_different_nodes_reach_everyone() -> Result<()> {
    let cluster = TestCluster::spawn(3).await?;

    for id in 1..=3 {
        let mut client = cluster.client(id).await?;
        let response = client
            .put(&format!("from-n{id}"), &format!("v{id}"), Some(TOKEN), 0)
            .await?;
        assert!(response.success);
    }

    for id in 1..=3 {
        let node = cluster.node(id);
        eventually("all keys on every node", || node.service().key_count() == 3).await?;
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn direct_replicate_is_not_forwarded() -> Result<()> {
    let cluster = TestCluster::spawn(3).await?;

    let mut client = cluster.client(2).await?;
    let response = client
        .replicate(ReplicationMessage::put("only-here", "x"))
        .await?;
    assert!(response.success);
    assert_eq!(value_at(cluster.node(2), "only-here").as_deref(), Some("x"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(value_at(cluster.node(1), "only-here").is_none());
    assert!(value_at(cluster.node(3), "only-here").is_none());
    assert_eq!(cluster.node(2).service().replication_counters().attempted, 0);

    cluster.shutdown().await
}

#[tokio::test]
async fn writes_succeed_when_every_peer_is_down() -> Result<()> {
    // Bind then drop to get addresses nothing listens on.
    let mut dead = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        dead.push(Peer::from(listener.local_addr()?));
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let node = spawn_node(config("lonely", dead), listener, None, Arc::new(TcpTransport))?;

    let mut client = RpcClient::connect(&node.rpc_addr.to_string()).await?;
    let first = client.put("k", "1", Some(TOKEN), 0).await?;
    let second = client.put("k", "2", Some(TOKEN), 0).await?;
    assert!(first.success && second.success);
    assert_eq!(second.new_version, 2);

    let deleted = client.delete("k", Some(TOKEN)).await?;
    assert!(deleted.success);

    let service = Arc::clone(node.service());
    eventually("failed replications counted", || {
        service.replication_counters().failed == 6
    })
    .await?;
    assert_eq!(service.replication_counters().delivered, 0);

    node.shutdown().await
}

#[tokio::test]
async fn silent_peer_does_not_slow_client_writes() -> Result<()> {
    // Accepts connections and never answers them.
    let silent = TcpListener::bind("127.0.0.1:0").await?;
    let silent_peer = Peer::from(silent.local_addr()?);
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let call_timeout = Duration::from_secs(2);
    let mut node_config = config("patient", vec![silent_peer]);
    node_config.replication.call_timeout = call_timeout;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let node = spawn_node(node_config, listener, None, Arc::new(TcpTransport))?;
    let service = Arc::clone(node.service());

    let mut client = RpcClient::connect(&node.rpc_addr.to_string()).await?;
    let started = Instant::now();
    let put = client.put("slow", "1", Some(TOKEN), 0).await?;
    let deleted = client.delete("slow", Some(TOKEN)).await?;
    let elapsed = started.elapsed();

    assert!(put.success);
    assert_eq!(put.new_version, 1);
    assert!(deleted.success);
    assert!(
        elapsed < Duration::from_millis(500),
        "writes took {elapsed:?} with a silent peer"
    );
    assert_eq!(service.replication_counters().failed, 0);

    // Both calls give up once the timeout passes, not before.
    tokio::time::sleep(call_timeout / 2).await;
    assert_eq!(service.replication_counters().failed, 0);
    let deadline = Instant::now() + call_timeout * 2;
    while service.replication_counters().failed < 2 {
        if Instant::now() > deadline {
            bail!("stalled replications were never counted as failed");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started.elapsed() >= call_timeout);
    assert_eq!(service.replication_counters().delivered, 0);

    hold.abort();
    node.shutdown().await
}

#[tokio::test]
async fn metadata_and_authenticate_over_tcp() -> Result<()> {
    let cluster = TestCluster::spawn(2).await?;
    let mut client = cluster.client(1).await?;

    let metadata = client.get_metadata().await?;
    assert_eq!(metadata.node_id, "n1");
    assert_eq!(metadata.role, "peer");
    assert_eq!(metadata.term, 0);

    let auth = client.authenticate("demo-key").await?;
    assert!(auth.success);
    assert_eq!(auth.token, TOKEN);

    let health = client.health_check().await?;
    assert!(health.healthy);

    cluster.shutdown().await
}
