use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::core::{IdPool, Scheduler};
use crate::rpc::Registry;

/// State shared by every connection.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub connections: Arc<Mutex<IdPool>>,
}

impl ServerContext {
    /// `registry` must be fully populated; it is frozen from here on.
    pub fn new(config: ServerConfig, registry: Registry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            connections: Arc::new(Mutex::new(IdPool::new())),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.registry.scheduler()
    }
}
