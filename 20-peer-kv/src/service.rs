//! Request handling for one node.
//!
//! Client calls are authenticated, validated and applied to the local store;
//! the ones that changed something are then handed to the replicator. Calls
//! from peers (`Replicate`) are applied directly and never fanned out again,
//! which is what keeps a fully connected cluster from echoing a write forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::error::NodeError;
use crate::peers::Peer;
use crate::protocol::{HealthCheckResponse, MetadataResponse, Operation, ReplicationMessage};
use crate::replication::{FanOutReport, PeerHealth, ReplicationCounters, Replicator};
use crate::store::{Entry, VersionedStore};

pub const MAX_KEY_LEN: usize = 1024;
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

const PLACEHOLDER_ROLE: &str = "peer";

/// Where a mutation came from. Only client mutations are fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Peer,
}

/// Store-level result of applying one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Stored { version: u64 },
    Deleted,
    Missing,
}

pub(crate) struct Applied {
    pub(crate) outcome: MutationOutcome,
    pub(crate) fan_out: Option<JoinHandle<FanOutReport>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub status: String,
    pub uptime: String,
    pub key_count: usize,
    pub host: String,
    pub port: u16,
    pub peer_count: usize,
    pub memory: MemoryUsage,
    pub cpu_usage_percent: f32,
    /// Last get, put, delete or replicate handled; startup time before any.
    pub last_operation_at: DateTime<Utc>,
    pub replication: ReplicationCounters,
}

pub struct NodeService {
    node_id: String,
    local: Peer,
    store: VersionedStore,
    auth: Authenticator,
    replicator: Replicator,
    started_at: Instant,
    last_operation_ms: AtomicI64,
    // Kept between calls so CPU usage is measured over the interval since
    // the previous status request.
    system: Mutex<System>,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        local: Peer,
        auth: Authenticator,
        replicator: Replicator,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            local,
            store: VersionedStore::new(),
            auth,
            replicator,
            started_at: Instant::now(),
            last_operation_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn authenticate(&self, api_key: &str) -> Result<String, NodeError> {
        self.auth.authenticate(api_key)
    }

    /// Checks a client token without performing any operation.
    pub fn check_token(&self, token: Option<&str>) -> Result<(), NodeError> {
        self.auth.validate(token)
    }

    pub fn get(&self, key: &str, token: Option<&str>) -> Result<Entry, NodeError> {
        self.auth.validate(token)?;
        validate_key(key)?;
        self.touch();
        self.store.get(key).ok_or_else(|| NodeError::not_found(key))
    }

    /// Stores `value` and returns the new version.
    ///
    /// `expected_version` is what the client thinks it is overwriting. It is
    /// accepted for wire compatibility but never compared; the last write
    /// wins.
    pub fn put(
        &self,
        key: String,
        value: String,
        token: Option<&str>,
        expected_version: u64,
    ) -> Result<u64, NodeError> {
        self.auth.validate(token)?;
        validate_key(&key)?;
        validate_value(&value)?;
        if expected_version != 0 {
            debug!(key = %key, expected_version, "ignoring client-supplied version");
        }

        match self.apply(ReplicationMessage::put(key, value), Origin::Client).outcome {
            MutationOutcome::Stored { version } => Ok(version),
            MutationOutcome::Deleted | MutationOutcome::Missing => Err(
                NodeError::InvalidArgument("put did not store a value".into()),
            ),
        }
    }

    pub fn delete(&self, key: &str, token: Option<&str>) -> Result<(), NodeError> {
        self.auth.validate(token)?;
        validate_key(key)?;
        match self.apply(ReplicationMessage::delete(key), Origin::Client).outcome {
            MutationOutcome::Deleted => Ok(()),
            _ => Err(NodeError::not_found(key)),
        }
    }

    /// Applies a mutation sent by a peer. No token, no onward fan-out.
    pub fn replicate(&self, message: ReplicationMessage) -> bool {
        if let Err(err) = validate_key(&message.key) {
            warn!(error = %err, "rejecting replicated mutation");
            return false;
        }
        match self.apply(message, Origin::Peer).outcome {
            MutationOutcome::Stored { .. } | MutationOutcome::Deleted => true,
            MutationOutcome::Missing => false,
        }
    }

    /// Commits `message` locally, then, for client mutations that changed the
    /// store, starts a fan-out. The store lock is released before the fan-out
    /// is spawned.
    pub(crate) fn apply(&self, message: ReplicationMessage, origin: Origin) -> Applied {
        self.touch();
        let outcome = match message.operation {
            Operation::Put => {
                let version = self.store.put(message.key.clone(), message.value.clone());
                MutationOutcome::Stored { version }
            }
            Operation::Delete => {
                if self.store.delete(&message.key) {
                    MutationOutcome::Deleted
                } else {
                    MutationOutcome::Missing
                }
            }
        };

        debug!(key = %message.key, ?origin, ?outcome, "applied mutation");
        let fan_out = match (origin, outcome) {
            (Origin::Client, MutationOutcome::Stored { .. } | MutationOutcome::Deleted) => {
                Some(self.replicator.fan_out(message))
            }
            _ => None,
        };
        Applied { outcome, fan_out }
    }

    fn touch(&self) {
        self.last_operation_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_operation_at(&self) -> DateTime<Utc> {
        let millis = self.last_operation_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    pub fn health_check(&self) -> HealthCheckResponse {
        HealthCheckResponse {
            healthy: true,
            status: "OK".to_string(),
        }
    }

    pub fn metadata(&self) -> MetadataResponse {
        MetadataResponse {
            node_id: self.node_id.clone(),
            role: PLACEHOLDER_ROLE.to_string(),
            term: 0,
            leader_id: String::new(),
            owned_shards: Vec::new(),
            shard_allocation: BTreeMap::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn key_count(&self) -> usize {
        self.store.count()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn replication_counters(&self) -> ReplicationCounters {
        self.replicator.counters()
    }

    pub fn peers(&self) -> &[Peer] {
        self.replicator.peers().all()
    }

    pub async fn peer_health(&self) -> Vec<PeerHealth> {
        self.replicator.probe_peers().await
    }

    pub fn status(&self) -> NodeStatus {
        let (memory, cpu_usage_percent) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.refresh_cpu();
            let memory = MemoryUsage {
                total_bytes: system.total_memory(),
                used_bytes: system.used_memory(),
                available_bytes: system.available_memory(),
            };
            (memory, system.global_cpu_info().cpu_usage())
        };

        NodeStatus {
            node_id: self.node_id.clone(),
            status: "healthy".to_string(),
            uptime: format!("{}s", self.uptime().as_secs()),
            key_count: self.key_count(),
            host: self.local.host.clone(),
            port: self.local.port,
            peer_count: self.replicator.peers().count(),
            memory,
            cpu_usage_percent,
            last_operation_at: self.last_operation_at(),
            replication: self.replication_counters(),
        }
    }
}

pub fn validate_key(key: &str) -> Result<(), NodeError> {
    if key.is_empty() {
        return Err(NodeError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(NodeError::InvalidArgument(format!(
            "key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key.contains('/') || key.chars().any(char::is_control) {
        return Err(NodeError::InvalidArgument(
            "key must not contain '/' or control characters".into(),
        ));
    }
    Ok(())
}

pub fn validate_value(value: &str) -> Result<(), NodeError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(NodeError::InvalidArgument(format!(
            "value exceeds {MAX_VALUE_LEN} bytes"
        )));
    }
    Ok(())
}
