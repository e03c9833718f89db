//! Wire shapes for every RPC plus the JSON-line framing they travel in.
//!
//! One request or response is one JSON object on its own `\n`-terminated
//! line. The `rpc` field names the call; the remaining fields are that call's
//! fixed request or response structure.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::service::{MAX_KEY_LEN, MAX_VALUE_LEN};

const LINE_ENDINGS: &[u8] = b"\r\n";

/// Longest line `read_message` accepts. Large enough for a maximal key and
/// value even when every byte is JSON-escaped as `\uXXXX`.
pub const MAX_FRAME_LEN: usize = 6 * (MAX_KEY_LEN + MAX_VALUE_LEN) + 4096;

/// A line ran past the frame limit before its newline arrived.
#[derive(Debug, Error)]
#[error("frame exceeds {limit} bytes")]
pub struct FrameTooLarge {
    pub limit: usize,
}

impl FrameTooLarge {
    /// Whether `err` came from an oversized frame rather than bad JSON.
    pub fn matches(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<FrameTooLarge>())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Put,
    Delete,
}

/// A mutation shipped from the node that accepted it to one of its peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMessage {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub operation: Operation,
}

impl ReplicationMessage {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operation: Operation::Put,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            operation: Operation::Delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticateRequest {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub success: bool,
    pub token: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetRequest {
    pub key: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetResponse {
    pub value: String,
    pub found: bool,
    pub version: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Version the client believes it is overwriting. Accepted, not compared.
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub new_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicateResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResponse {
    pub healthy: bool,
    pub status: String,
}

/// Node identity. `role`, `term`, `leader_id` and the shard fields are inert
/// placeholders: no election or sharding runs behind them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataResponse {
    pub node_id: String,
    pub role: String,
    pub term: u64,
    pub leader_id: String,
    pub owned_shards: Vec<u32>,
    pub shard_allocation: BTreeMap<u32, String>,
}

// Reserved shapes. They decode so that a peer speaking them gets a clear
// error back instead of a framing failure; nothing acts on them.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    #[serde(default)]
    pub entries: Vec<ReplicationMessage>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferShardRequest {
    pub shard_id: u32,
    pub target_node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum Request {
    Authenticate(AuthenticateRequest),
    Get(GetRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
    Replicate(ReplicationMessage),
    HealthCheck,
    GetMetadata,
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    TransferShard(TransferShardRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Authenticate(_) => "Authenticate",
            Request::Get(_) => "Get",
            Request::Put(_) => "Put",
            Request::Delete(_) => "Delete",
            Request::Replicate(_) => "Replicate",
            Request::HealthCheck => "HealthCheck",
            Request::GetMetadata => "GetMetadata",
            Request::RequestVote(_) => "RequestVote",
            Request::AppendEntries(_) => "AppendEntries",
            Request::TransferShard(_) => "TransferShard",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum Response {
    Authenticate(AuthenticateResponse),
    Get(GetResponse),
    Put(PutResponse),
    Delete(DeleteResponse),
    Replicate(ReplicateResponse),
    HealthCheck(HealthCheckResponse),
    GetMetadata(MetadataResponse),
    Error(ErrorResponse),
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_message_within(reader, MAX_FRAME_LEN).await
}

/// Like [`read_message`] with an explicit frame limit. A longer line fails
/// with [`FrameTooLarge`] after at most `limit + 1` bytes are buffered.
pub async fn read_message_within<R, T>(reader: &mut R, limit: usize) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Line framing keeps the protocol usable from netcat while debugging a cluster.
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if line.len() > limit && line.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                FrameTooLarge { limit },
            ));
        }

        let end = line
            .iter()
            .rposition(|byte| !LINE_ENDINGS.contains(byte))
            .map_or(0, |last| last + 1);
        if end == 0 {
            continue;
        }

        let parsed = serde_json::from_slice(&line[..end]).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
