use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::protocol::{
    AuthenticateRequest, AuthenticateResponse, DeleteRequest, DeleteResponse, GetRequest,
    GetResponse, HealthCheckResponse, MetadataResponse, PutRequest, PutResponse,
    ReplicateResponse, ReplicationMessage, Request, Response, read_message, write_message,
};

/// Connection to one node's RPC port.
///
/// Calls are strictly request/response over a single connection, so a client
/// is used by one task at a time.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.writer, request)
            .await
            .with_context(|| format!("failed to send {}", request.name()))?;
        read_message::<_, Response>(&mut self.reader)
            .await
            .with_context(|| format!("failed to read {} response", request.name()))?
            .ok_or_else(|| anyhow!("connection closed before {} response", request.name()))
    }

    pub async fn authenticate(&mut self, api_key: &str) -> Result<AuthenticateResponse> {
        let request = Request::Authenticate(AuthenticateRequest {
            api_key: api_key.to_string(),
        });
        match self.call(&request).await? {
            Response::Authenticate(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn get(&mut self, key: &str, token: Option<&str>) -> Result<GetResponse> {
        let request = Request::Get(GetRequest {
            key: key.to_string(),
            auth_token: token.map(str::to_string),
        });
        match self.call(&request).await? {
            Response::Get(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn put(
        &mut self,
        key: &str,
        value: &str,
        token: Option<&str>,
        version: u64,
    ) -> Result<PutResponse> {
        let request = Request::Put(PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            auth_token: token.map(str::to_string),
            version,
        });
        match self.call(&request).await? {
            Response::Put(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn delete(&mut self, key: &str, token: Option<&str>) -> Result<DeleteResponse> {
        let request = Request::Delete(DeleteRequest {
            key: key.to_string(),
            auth_token: token.map(str::to_string),
        });
        match self.call(&request).await? {
            Response::Delete(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn replicate(&mut self, message: ReplicationMessage) -> Result<ReplicateResponse> {
        let request = Request::Replicate(message);
        match self.call(&request).await? {
            Response::Replicate(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn health_check(&mut self) -> Result<HealthCheckResponse> {
        let request = Request::HealthCheck;
        match self.call(&request).await? {
            Response::HealthCheck(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn get_metadata(&mut self) -> Result<MetadataResponse> {
        let request = Request::GetMetadata;
        match self.call(&request).await? {
            Response::GetMetadata(response) => Ok(response),
            other => unexpected(&request, other),
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn unexpected<T>(request: &Request, response: Response) -> Result<T> {
    match response {
        Response::Error(err) => bail!("{} failed: {}", request.name(), err.error),
        other => bail!("unexpected response to {}: {other:?}", request.name()),
    }
}
