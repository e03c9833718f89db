//! HTTP endpoints for dashboards, load balancers and curl.
//!
//! Each handler is a thin translation onto [`NodeService`]; the same auth,
//! validation and replication rules apply as on the RPC port. The auth token
//! travels in the `x-auth-token` header.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::NodeError;
use crate::replication::PeerHealth;
use crate::service::{NodeService, NodeStatus};

pub const AUTH_HEADER: &str = "x-auth-token";

type AppState = Arc<NodeService>;

pub fn router(service: Arc<NodeService>) -> Router {
    Router::new()
        .route(
            "/store/:key",
            get(get_value).put(put_value).delete(delete_value),
        )
        .route("/status", get(status))
        .route("/keys", get(keys))
        .route("/node-info", get(node_info))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub struct PutBody {
    pub value: String,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueBody {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutReply {
    pub key: String,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteReply {
    pub key: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeysReply {
    pub keys: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub peers: Vec<PeerHealth>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status = match &self {
            NodeError::Unauthenticated => StatusCode::UNAUTHORIZED,
            NodeError::NotFound { .. } => StatusCode::NOT_FOUND,
            NodeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            NodeError::PeerUnreachable { .. } => StatusCode::BAD_GATEWAY,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn auth_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTH_HEADER).and_then(|value| value.to_str().ok())
}

async fn get_value(
    State(service): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ValueBody>, NodeError> {
    let entry = service.get(&key, auth_token(&headers))?;
    Ok(Json(ValueBody {
        key,
        value: entry.value,
        version: entry.version,
        updated_at: entry.updated_at,
    }))
}

async fn put_value(
    State(service): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Result<Json<PutBody>, JsonRejection>,
) -> Result<Json<PutReply>, NodeError> {
    let token = auth_token(&headers);
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            service.check_token(token)?;
            return Err(NodeError::InvalidArgument(rejection.body_text()));
        }
    };
    let version = service.put(key.clone(), body.value, token, body.version)?;
    Ok(Json(PutReply { key, version }))
}

async fn delete_value(
    State(service): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteReply>, NodeError> {
    service.delete(&key, auth_token(&headers))?;
    Ok(Json(DeleteReply { key, deleted: true }))
}

async fn status(State(service): State<AppState>) -> Json<NodeStatus> {
    Json(service.status())
}

async fn keys(State(service): State<AppState>) -> Json<KeysReply> {
    let keys = service.keys();
    Json(KeysReply {
        count: keys.len(),
        keys,
    })
}

async fn node_info(State(service): State<AppState>) -> Json<NodeInfo> {
    Json(NodeInfo {
        node_id: service.node_id().to_string(),
        peers: service.peer_health().await,
    })
}
