//! TCP transport and the per-connection dispatch loop.
//!
//! Each accepted connection gets a connection id and its own task. The task
//! reads reassembled messages, decodes them, dispatches through the registry
//! and queues the reply on the connection's outbox. Messages of one
//! connection are handled strictly in arrival order.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::ServerContext;
use crate::core::ConnectionId;
use crate::error::RpcFailure;
use crate::frame::{self, FrameError, Message};

use super::methods::{Caller, Registry};
use super::protocol::{self, Envelope};

/// Accepts client connections.
pub struct Transport {
    listener: TcpListener,
    ctx: ServerContext,
}

impl Transport {
    pub async fn bind(bind_addr: SocketAddr, ctx: ServerContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                            }
                            let ctx = self.ctx.clone();
                            let conn = ctx.connections.lock().await.acquire();
                            debug!(peer = %peer_addr, conn, "Client connected");

                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, conn, ctx.clone()).await {
                                        debug!(error = %e, "Connection error");
                                    }
                                    ctx.connections.lock().await.release(conn);
                                    debug!("Client disconnected");
                                }
                                .instrument(info_span!("conn", conn, peer = %peer_addr)),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Serve one connection until it closes.
///
/// Returns `Ok` on a graceful close. Either way, every task the connection
/// owns is disconnected before this returns, even if the loop panicked.
pub async fn handle_connection<S>(stream: S, conn: ConnectionId, ctx: ServerContext) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer, outbox) = frame::split(stream, ctx.config.frame_limits());
    let writer = tokio::spawn(writer.run());
    let caller = Caller::new(conn, Some(outbox.clone()));

    let serve = async {
        loop {
            let message = match reader.receive().await {
                Ok(message) => message,
                Err(e) => break e,
            };

            if let Some(reply) = process(&ctx.registry, &caller, message).await
                && !outbox.send(reply).await
            {
                break FrameError::Disconnected;
            }
        }
    };
    let err = AssertUnwindSafe(serve).catch_unwind().await.unwrap_or_else(|_| {
        error!("Connection loop panicked");
        FrameError::Panicked
    });

    ctx.registry.scheduler().disconnect(conn).await;

    // the reader already answered a peer's close frame
    if !matches!(err, FrameError::Closed { .. }) {
        outbox.close(err.close_status(), err.to_string()).await;
    }
    drop(caller);
    drop(outbox);
    let _ = writer.await;

    if err.is_graceful() {
        debug!("Connection closed");
        Ok(())
    } else {
        Err(err)
    }
}

/// Handle one inbound message and build the reply, if one is owed.
async fn process(registry: &Arc<Registry>, caller: &Caller, message: Message) -> Option<Message> {
    let request = match protocol::decode_request(message) {
        Ok(request) => request,
        Err(failure) => {
            warn!(code = failure.code(), error = %failure, "Rejected malformed request");
            return encode_reply(Envelope::error(None, &failure), None);
        }
    };

    let id = request.id.clone();
    let method = request.method.clone();
    debug!(%method, id = ?id, "Request received");

    let result = registry.dispatch(caller, request).await;
    let Some(id) = id else {
        if let Err(failure) = result {
            debug!(%method, error = %failure, "Fire-and-forget request failed");
        }
        return None;
    };

    let (envelope, blob) = match result {
        Ok(response) => (Envelope::reply(id, response.result), response.blob),
        Err(failure) => {
            debug!(%method, code = failure.code(), error = %failure, "Request failed");
            (Envelope::error(Some(id), &failure), None)
        }
    };
    encode_reply(envelope, blob)
}

/// Encode a reply, as a binary message when a blob is attached.
fn encode_reply(envelope: Envelope, blob: Option<Bytes>) -> Option<Message> {
    match protocol::encode(&envelope, blob.as_deref()) {
        Ok(message) => Some(message),
        Err(e) => {
            let failure = RpcFailure::from(e);
            error!(error = %failure, "Failed to encode reply");
            let id = match envelope {
                Envelope::Reply(reply) => Some(reply.id),
                Envelope::Error(reply) => reply.id,
                _ => None,
            };
            protocol::encode(&Envelope::error(id, &failure), None).ok()
        }
    }
}
