//! RPC client for talking to a running server.
//!
//! Speaks the same framing as the server. Calls are issued one at a time;
//! progress notifications that arrive while waiting for a reply are handed
//! to the caller's callback.

use std::net::SocketAddr;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::frame::{self, CloseStatus, FrameError, FrameLimits, FrameReader, Outbox};

use super::protocol::{self, Envelope, EnvelopeError, ProgressUpdate, Request, RequestId, RpcError};

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to server: {0}")]
    Connect(std::io::Error),
    #[error("Connection error: {0}")]
    Transport(#[from] FrameError),
    #[error("Failed to encode request: {0}")]
    Encode(#[from] EnvelopeError),
    #[error("Unreadable message from server: {0}")]
    Decode(String),
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

/// Client side of one connection.
pub struct RpcClient<S> {
    reader: FrameReader<ReadHalf<S>>,
    outbox: Outbox,
    writer: JoinHandle<()>,
    next_id: i64,
}

impl RpcClient<TcpStream> {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        Ok(Self::new(stream, FrameLimits::default()))
    }
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, limits: FrameLimits) -> Self {
        let (reader, writer, outbox) = frame::split(stream, limits);
        Self {
            reader,
            outbox,
            writer: tokio::spawn(writer.run()),
            next_id: 1,
        }
    }

    /// Call a method and wait for its reply.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.call_with_progress(method, params, |_| {}).await
    }

    /// Call a method, reporting progress notifications addressed to this
    /// request while waiting for the reply.
    pub async fn call_with_progress(
        &mut self,
        method: &str,
        params: Value,
        on_progress: impl FnMut(&ProgressUpdate),
    ) -> Result<Value, ClientError> {
        let (result, _blob) = self.round_trip(method, params, None, on_progress).await?;
        Ok(result)
    }

    /// Call a method with a blob attached, returning the result together
    /// with any blob the reply carried.
    pub async fn call_with_blob(
        &mut self,
        method: &str,
        params: Value,
        blob: impl Into<Bytes>,
    ) -> Result<(Value, Option<Bytes>), ClientError> {
        self.round_trip(method, params, Some(blob.into()), |_| {}).await
    }

    async fn round_trip(
        &mut self,
        method: &str,
        params: Value,
        blob: Option<Bytes>,
        mut on_progress: impl FnMut(&ProgressUpdate),
    ) -> Result<(Value, Option<Bytes>), ClientError> {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;

        let mut request = Request::new(Some(id.clone()), method, params);
        if let Some(blob) = blob {
            request = request.with_blob(blob);
        }
        self.send(request).await?;

        loop {
            let message = self.reader.receive().await?;
            let (envelope, blob) =
                protocol::decode(message).map_err(|e| ClientError::Decode(e.to_string()))?;
            match envelope {
                Envelope::Reply(reply) if reply.id == id => return Ok((reply.result, blob)),
                Envelope::Error(reply) if reply.id.as_ref() == Some(&id) || reply.id.is_none() => {
                    return Err(ClientError::Rpc(reply.error));
                }
                Envelope::Progress(update) => {
                    if update.id == id {
                        on_progress(&update);
                    } else {
                        debug!(id = %update.id, "Progress for another request");
                    }
                }
                other => debug!(envelope = ?other, "Ignoring unrelated message"),
            }
        }
    }

    /// Send a request without an id. The server never replies to it.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ClientError> {
        self.send(Request::new(None, method, params)).await
    }

    /// Close the connection and wait for the writer to finish.
    pub async fn close(self) {
        self.outbox.close(CloseStatus::Normal, "").await;
        drop(self.outbox);
        let _ = self.writer.await;
    }

    async fn send(&self, request: Request) -> Result<(), ClientError> {
        let blob = request.blob.clone();
        let message = protocol::encode(&Envelope::Request(request), blob.as_deref())?;
        if !self.outbox.send(message).await {
            return Err(FrameError::Disconnected.into());
        }
        Ok(())
    }
}
