use thiserror::Error;

use crate::peers::Peer;

/// Failures a node can report.
///
/// The first three are returned synchronously to whoever issued the request.
/// `PeerUnreachable` only ever appears inside the replication fan-out and the
/// on-demand peer probes; it is logged there and never handed back to a client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("missing or invalid auth token")]
    Unauthenticated,

    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: Peer, reason: String },
}

impl NodeError {
    pub fn not_found(key: impl Into<String>) -> Self {
        NodeError::NotFound { key: key.into() }
    }

    pub fn unreachable(peer: &Peer, reason: impl ToString) -> Self {
        NodeError::PeerUnreachable {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }
}
