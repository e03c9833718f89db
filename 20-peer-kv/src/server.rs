use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::protocol::{
    AuthenticateResponse, DeleteResponse, ErrorResponse, FrameTooLarge, GetResponse, PutResponse,
    ReplicateResponse, Request, Response, read_message, write_message,
};
use crate::service::NodeService;

/// Accepts RPC connections and answers each framed request in order.
pub struct RpcServer {
    listener: TcpListener,
    service: Arc<NodeService>,
}

impl RpcServer {
    pub fn new(listener: TcpListener, service: Arc<NodeService>) -> Self {
        Self { listener, service }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer { listener, service } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("rpc server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &service);
                }
            }
        }

        Ok(())
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    service: &Arc<NodeService>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, service),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, service: &Arc<NodeService>) {
    let service = Arc::clone(service);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, &service).await {
            warn!(peer = %peer, error = ?err, "rpc connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, service: &NodeService) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    debug!(?peer, "rpc connection opened");
    while serve_next(&mut reader, &mut writer, service).await? {}
    debug!(?peer, "rpc connection closed");

    Ok(())
}

/// Reads one request and writes its response. Returns `false` once the
/// connection should close: end of stream or an oversized frame.
async fn serve_next<R, W>(reader: &mut R, writer: &mut W, service: &NodeService) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let response = match read_message::<_, Request>(reader).await {
        Ok(Some(request)) => dispatch(service, request),
        Ok(None) => return Ok(false),
        Err(err) if FrameTooLarge::matches(&err) => {
            // The rest of the line is still in flight; resyncing is not possible.
            warn!(error = %err, "closing connection after oversized frame");
            let response = Response::Error(ErrorResponse {
                error: NodeError::InvalidArgument(err.to_string()).to_string(),
            });
            write_message(writer, &response).await?;
            return Ok(false);
        }
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            // The bad line has been consumed; the connection stays usable.
            Response::Error(ErrorResponse {
                error: format!("malformed request: {err}"),
            })
        }
        Err(err) => return Err(err.into()),
    };

    write_message(writer, &response).await?;
    Ok(true)
}

/// Maps one decoded request onto the service and shapes the reply.
pub fn dispatch(service: &NodeService, request: Request) -> Response {
    match request {
        Request::Authenticate(req) => {
            let response = match service.authenticate(&req.api_key) {
                Ok(token) => AuthenticateResponse {
                    success: true,
                    token,
                    error: None,
                },
                Err(_) => AuthenticateResponse {
                    success: false,
                    token: String::new(),
                    error: Some("invalid api key".to_string()),
                },
            };
            Response::Authenticate(response)
        }
        Request::Get(req) => {
            let response = match service.get(&req.key, req.auth_token.as_deref()) {
                Ok(entry) => GetResponse {
                    value: entry.value,
                    found: true,
                    version: entry.version,
                    error: None,
                },
                Err(err) => GetResponse {
                    value: String::new(),
                    found: false,
                    version: 0,
                    error: Some(err.to_string()),
                },
            };
            Response::Get(response)
        }
        Request::Put(req) => {
            let result = service.put(req.key, req.value, req.auth_token.as_deref(), req.version);
            Response::Put(match result {
                Ok(new_version) => PutResponse {
                    success: true,
                    error: None,
                    new_version,
                },
                Err(err) => PutResponse {
                    success: false,
                    error: Some(err.to_string()),
                    new_version: 0,
                },
            })
        }
        Request::Delete(req) => {
            let result = service.delete(&req.key, req.auth_token.as_deref());
            Response::Delete(DeleteResponse {
                success: result.is_ok(),
                error: result.err().as_ref().map(NodeError::to_string),
            })
        }
        Request::Replicate(message) => Response::Replicate(ReplicateResponse {
            success: service.replicate(message),
        }),
        Request::HealthCheck => Response::HealthCheck(service.health_check()),
        Request::GetMetadata => Response::GetMetadata(service.metadata()),
        reserved @ (Request::RequestVote(_)
        | Request::AppendEntries(_)
        | Request::TransferShard(_)) => {
            debug!(rpc = reserved.name(), "reserved rpc received");
            Response::Error(ErrorResponse {
                error: format!("{} is reserved and not implemented", reserved.name()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::auth::Authenticator;
    use crate::peers::{Peer, PeerRegistry};
    use crate::protocol::{
        DeleteRequest, GetRequest, MAX_FRAME_LEN, PutRequest, ReplicationMessage,
        TransferShardRequest,
    };
    use crate::replication::{ReplicationSettings, Replicator, testing::RecordingTransport};

    fn service() -> NodeService {
        let local = Peer::new("127.0.0.1", 7001);
        let replicator = Replicator::new(
            PeerRegistry::new(&local, Vec::new()),
            Arc::new(RecordingTransport::default()),
            ReplicationSettings::default(),
        );
        NodeService::new("n1", local, Authenticator::new("t", Vec::new()), replicator)
    }

    #[tokio::test]
    async fn get_miss_reports_not_found() {
        let svc = service();
        let response = dispatch(
            &svc,
            Request::Get(GetRequest {
                key: "a".into(),
                auth_token: Some("t".into()),
            }),
        );
        assert_eq!(
            response,
            Response::Get(GetResponse {
                value: String::new(),
                found: false,
                version: 0,
                error: Some("key not found: a".into()),
            })
        );
    }

    #[tokio::test]
    async fn put_reports_new_version() {
        let svc = service();
        let put = |value: &str| {
            dispatch(
                &svc,
                Request::Put(PutRequest {
                    key: "a".into(),
                    value: value.into(),
                    auth_token: Some("t".into()),
                    version: 0,
                }),
            )
        };
        assert!(matches!(put("1"), Response::Put(PutResponse { success: true, new_version: 1, .. })));
        assert!(matches!(put("2"), Response::Put(PutResponse { success: true, new_version: 2, .. })));
    }

    #[tokio::test]
    async fn unauthenticated_put_is_refused() {
        let svc = service();
        let response = dispatch(
            &svc,
            Request::Put(PutRequest {
                key: "a".into(),
                value: "1".into(),
                auth_token: None,
                version: 0,
            }),
        );
        assert_eq!(
            response,
            Response::Put(PutResponse {
                success: false,
                error: Some("missing or invalid auth token".into()),
                new_version: 0,
            })
        );
    }

    #[tokio::test]
    async fn delete_missing_reports_failure() {
        let svc = service();
        let response = dispatch(
            &svc,
            Request::Delete(DeleteRequest {
                key: "missing".into(),
                auth_token: Some("t".into()),
            }),
        );
        assert!(matches!(response, Response::Delete(DeleteResponse { success: false, error: Some(_) })));
    }

    #[tokio::test]
    async fn replicate_needs_no_token() {
        let svc = service();
        let response = dispatch(&svc, Request::Replicate(ReplicationMessage::put("a", "x")));
        assert_eq!(response, Response::Replicate(ReplicateResponse { success: true }));
        assert_eq!(svc.get("a", Some("t")).unwrap().value, "x");
    }

    #[tokio::test]
    async fn reserved_rpcs_are_answered_with_an_error() {
        let svc = service();
        let response = dispatch(
            &svc,
            Request::TransferShard(TransferShardRequest {
                shard_id: 1,
                target_node_id: "n2".into(),
            }),
        );
        assert_eq!(
            response,
            Response::Error(ErrorResponse {
                error: "TransferShard is reserved and not implemented".into()
            })
        );
    }

    #[tokio::test]
    async fn malformed_line_keeps_connection_open() {
        let svc = service();
        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);

        client.write_all(b"{not json}\n{\"rpc\":\"health_check\"}\n").await.unwrap();

        assert!(serve_next(&mut server_read, &mut server_write, &svc).await.unwrap());
        assert!(serve_next(&mut server_read, &mut server_write, &svc).await.unwrap());

        let mut client = BufReader::new(client);
        let first = read_message::<_, Response>(&mut client).await.unwrap().unwrap();
        assert!(matches!(first, Response::Error(_)));
        let second = read_message::<_, Response>(&mut client).await.unwrap().unwrap();
        assert!(matches!(second, Response::HealthCheck(_)));
    }

    #[tokio::test]
    async fn oversized_line_is_refused_and_connection_closed() {
        let svc = service();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);

        // Never terminated: the server must give up before the newline.
        let sender = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            let mut sent = 0;
            while sent <= MAX_FRAME_LEN {
                if client_write.write_all(&chunk).await.is_err() {
                    break;
                }
                sent += chunk.len();
            }
            client_write
        });

        let keep_open = tokio::time::timeout(
            Duration::from_secs(10),
            serve_next(&mut server_read, &mut server_write, &svc),
        )
        .await
        .expect("server stalled on an oversized frame")
        .unwrap();
        assert!(!keep_open);

        let mut client_read = BufReader::new(client_read);
        let response = read_message::<_, Response>(&mut client_read).await.unwrap().unwrap();
        assert_eq!(
            response,
            Response::Error(ErrorResponse {
                error: format!("invalid argument: frame exceeds {MAX_FRAME_LEN} bytes"),
            })
        );
        assert_eq!(svc.key_count(), 0);
        sender.abort();
    }
}
