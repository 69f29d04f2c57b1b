//! RPC server for client communication.
//!
//! JSON-RPC 2.0 envelopes carried over the framed transport in
//! [`crate::frame`].
//!
//! ## Architecture
//!
//! - `protocol`: envelope types and the text/binary wire encoding
//! - `methods`: endpoint registry, parameter validation and the built-in
//!   task control methods
//! - `transport`: TCP listener and the per-connection dispatch loop
//! - `client`: client for connecting to the server

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::context::ServerContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{Call, Caller, Endpoint, EndpointInfo, Registry, RegistryError, Response};
pub use protocol::{Envelope, Request, RequestId, RpcError};
pub use transport::handle_connection;

/// RPC server exposing the registry to clients.
pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(ctx: ServerContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, ctx).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            transport,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Start accepting connections. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    /// Signal the server to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
