//! HTTP side server.
//!
//! ## Endpoints
//!
//! - `GET /health` - liveness check with connection and task counts
//! - `GET /methods` - the endpoint catalogue

use std::net::SocketAddr;
use std::time::Instant;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::context::ServerContext;
use crate::rpc::EndpointInfo;

/// Shared state for the web server
#[derive(Clone)]
pub struct WebState {
    pub ctx: ServerContext,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub tasks: usize,
    pub queued: usize,
    pub busy: bool,
}

/// Liveness server.
pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: ServerContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            state: WebState {
                ctx,
                started: Instant::now(),
            },
            shutdown_tx,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the web server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Health server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/methods", get(methods))
        .with_state(state)
}

async fn health(State(state): State<WebState>) -> Json<Health> {
    let scheduler = state.ctx.scheduler();
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        connections: state.ctx.connections.lock().await.live_count(),
        tasks: scheduler.tracked_len().await,
        queued: scheduler.queued_len().await,
        busy: scheduler.is_busy().await,
    })
}

async fn methods(State(state): State<WebState>) -> Json<Vec<EndpointInfo>> {
    Json(state.ctx.registry.catalogue())
}
