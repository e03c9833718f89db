//! Peer-to-peer in-memory key-value store.
//!
//! Every node serves reads and writes on its own, commits them to a local
//! versioned map, and pushes each client write to its peers in the
//! background. There is no leader and no repair; peers converge as long as
//! replication calls get through.
//!
//! - [`store`] holds the versioned map.
//! - [`service`] applies requests: auth, validation, commit, then fan-out.
//! - [`replication`] sends committed mutations to peers over a
//!   [`replication::PeerTransport`].
//! - [`peers`] parses peer addresses and builds the fixed registry.
//! - [`protocol`] defines the JSON-line RPC messages; [`server`] and
//!   [`client`] speak it over TCP.
//! - [`http`] exposes the same operations plus status pages over HTTP.
//! - [`node`] wires a service to its listeners; [`cli`], [`config`] and
//!   [`commands`] back the binary.

pub mod auth;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod service;
pub mod store;
