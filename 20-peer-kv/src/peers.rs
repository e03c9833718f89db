use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network address of another node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerParseError {
    #[error("peer '{0}' must be host:port")]
    MissingPort(String),
    #[error("peer '{0}' has an empty host")]
    EmptyHost(String),
    #[error("peer '{0}' has an invalid port")]
    InvalidPort(String),
}

impl FromStr for Peer {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let Some((host, port)) = trimmed.rsplit_once(':') else {
            return Err(PeerParseError::MissingPort(trimmed.to_string()));
        };
        // Bracketed IPv6 literals keep their brackets out of the host.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(PeerParseError::EmptyHost(trimmed.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| PeerParseError::InvalidPort(trimmed.to_string()))?;
        Ok(Peer::new(host, port))
    }
}

/// Fixed set of peers known at startup.
///
/// Built once and never mutated: there is no discovery, no eviction of dead
/// peers and no membership change. The node's own address is filtered out so
/// the same cluster-wide list can be handed to every node.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    /// Builds the registry, dropping `local` and duplicate entries while
    /// keeping the first-seen order.
    ///
    /// Self detection is textual: `localhost:7001` is not recognised as
    /// `127.0.0.1:7001`.
    pub fn new(local: &Peer, peers: impl IntoIterator<Item = Peer>) -> Self {
        let mut unique: Vec<Peer> = Vec::new();
        for peer in peers {
            if &peer == local || unique.contains(&peer) {
                continue;
            }
            unique.push(peer);
        }
        Self { peers: unique }
    }

    pub fn all(&self) -> &[Peer] {
        &self.peers
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }
}
