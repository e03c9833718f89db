//! Best-effort propagation of locally accepted mutations.
//!
//! A fan-out runs in a detached task: the client is answered as soon as the
//! local store commits, and whatever happens to the peers afterwards is only
//! logged and counted. There is no acknowledgement, no retry, and no ordering
//! across peers.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle, time::timeout};
use tracing::{debug, warn};

use crate::client::RpcClient;
use crate::error::NodeError;
use crate::peers::{Peer, PeerRegistry};
use crate::protocol::{HealthCheckResponse, ReplicationMessage};

/// Outbound calls a node makes to its peers.
///
/// Boxed futures keep the trait object-safe so the service can hold an
/// `Arc<dyn PeerTransport>` and tests can swap in an in-memory recorder.
pub trait PeerTransport: Send + Sync + 'static {
    /// Delivers `message` to `peer`. `Ok(applied)` carries the peer's
    /// `success` flag; `Err` means the peer could not be reached.
    fn replicate(
        &self,
        peer: &Peer,
        message: ReplicationMessage,
    ) -> BoxFuture<'static, Result<bool, NodeError>>;

    fn health_check(&self, peer: &Peer) -> BoxFuture<'static, Result<HealthCheckResponse, NodeError>>;
}

/// Opens a fresh RPC connection per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl PeerTransport for TcpTransport {
    fn replicate(
        &self,
        peer: &Peer,
        message: ReplicationMessage,
    ) -> BoxFuture<'static, Result<bool, NodeError>> {
        let peer = peer.clone();
        async move {
            let mut client = RpcClient::connect(&peer.address())
                .await
                .map_err(|err| NodeError::unreachable(&peer, format!("{err:#}")))?;
            let response = client
                .replicate(message)
                .await
                .map_err(|err| NodeError::unreachable(&peer, format!("{err:#}")))?;
            close_quietly(client, &peer).await;
            Ok(response.success)
        }
        .boxed()
    }

    fn health_check(&self, peer: &Peer) -> BoxFuture<'static, Result<HealthCheckResponse, NodeError>> {
        let peer = peer.clone();
        async move {
            let mut client = RpcClient::connect(&peer.address())
                .await
                .map_err(|err| NodeError::unreachable(&peer, format!("{err:#}")))?;
            let response = client
                .health_check()
                .await
                .map_err(|err| NodeError::unreachable(&peer, format!("{err:#}")))?;
            close_quietly(client, &peer).await;
            Ok(response)
        }
        .boxed()
    }
}

/// The call already succeeded; a failed close only matters for debugging.
async fn close_quietly(client: RpcClient, peer: &Peer) {
    if let Err(err) = client.shutdown().await {
        debug!(peer = %peer, error = ?err, "failed to close peer connection");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationSettings {
    /// Upper bound on a single outbound call.
    pub call_timeout: Duration,
    /// Outbound calls allowed in flight at once across all fan-outs.
    pub max_in_flight: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Default)]
struct ReplicationStats {
    attempted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the fan-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationCounters {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// What one fan-out achieved. Only tests and logs look at this.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub delivered: Vec<Peer>,
    pub failed: Vec<NodeError>,
}

/// Result of an on-demand peer probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerHealth {
    pub peer: Peer,
    pub healthy: bool,
    pub status: String,
}

pub struct Replicator {
    peers: PeerRegistry,
    transport: Arc<dyn PeerTransport>,
    settings: ReplicationSettings,
    permits: Arc<Semaphore>,
    stats: Arc<ReplicationStats>,
}

impl Replicator {
    pub fn new(
        peers: PeerRegistry,
        transport: Arc<dyn PeerTransport>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            peers,
            transport,
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            settings,
            stats: Arc::new(ReplicationStats::default()),
        }
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Starts delivering `message` to every peer and returns immediately.
    ///
    /// The returned handle may be dropped; the task keeps running detached.
    pub fn fan_out(&self, message: ReplicationMessage) -> JoinHandle<FanOutReport> {
        let calls: Vec<_> = self
            .peers
            .all()
            .iter()
            .cloned()
            .map(|peer| self.replicate_to(peer, message.clone()))
            .collect();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut report = FanOutReport::default();
            for outcome in join_all(calls).await {
                match outcome {
                    Ok(peer) => {
                        stats.delivered.fetch_add(1, Ordering::Relaxed);
                        report.delivered.push(peer);
                    }
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        report.failed.push(err);
                    }
                }
            }
            report
        })
    }

    fn replicate_to(
        &self,
        peer: Peer,
        message: ReplicationMessage,
    ) -> impl std::future::Future<Output = Result<Peer, NodeError>> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let permits = Arc::clone(&self.permits);
        let stats = Arc::clone(&self.stats);
        let call_timeout = self.settings.call_timeout;

        async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|err| NodeError::unreachable(&peer, err))?;
            stats.attempted.fetch_add(1, Ordering::Relaxed);

            let call = transport.replicate(&peer, message.clone());
            let result = match timeout(call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::unreachable(
                    &peer,
                    format!("no answer within {call_timeout:?}"),
                )),
            };

            match result {
                Ok(applied) => {
                    debug!(
                        peer = %peer,
                        key = %message.key,
                        operation = ?message.operation,
                        applied,
                        "replicated mutation"
                    );
                    Ok(peer)
                }
                Err(err) => {
                    warn!(
                        key = %message.key,
                        operation = ?message.operation,
                        error = %err,
                        "replication failed"
                    );
                    Err(err)
                }
            }
        }
    }

    /// Probes every peer's health concurrently. Nothing is remembered.
    pub async fn probe_peers(&self) -> Vec<PeerHealth> {
        let probes = self.peers.all().iter().cloned().map(|peer| {
            let call = self.transport.health_check(&peer);
            let call_timeout = self.settings.call_timeout;
            async move {
                match timeout(call_timeout, call).await {
                    Ok(Ok(response)) => PeerHealth {
                        peer,
                        healthy: response.healthy,
                        status: response.status,
                    },
                    Ok(Err(err)) => PeerHealth {
                        peer,
                        healthy: false,
                        status: err.to_string(),
                    },
                    Err(_) => PeerHealth {
                        peer,
                        healthy: false,
                        status: format!("no answer within {call_timeout:?}"),
                    },
                }
            }
        });
        join_all(probes).await
    }

    pub fn counters(&self) -> ReplicationCounters {
        ReplicationCounters {
            attempted: self.stats.attempted.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}
