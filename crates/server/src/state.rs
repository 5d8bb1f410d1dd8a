//! Application state

use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::registry::ClientRegistry;
use crate::router::MessageRouter;
use crate::transport::ProcessTransport;

/// Shared application state
pub struct RelayState {
    /// Connected clients and their roles
    pub registry: Arc<ClientRegistry>,

    pub router: MessageRouter,

    /// The child MCP server
    pub transport: Arc<ProcessTransport>,

    /// Outbound queue depth per client
    pub client_queue: usize,
}

impl RelayState {
    /// Wire the components together. The child is not spawned until
    /// `transport.start()` is called.
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let transport = Arc::new(ProcessTransport::new(
            config.child_command(),
            config.restart_policy(),
            config.child_queue,
            broadcaster.clone(),
        ));
        let router = MessageRouter::new(
            registry.clone(),
            broadcaster,
            transport.clone(),
            config.content_store.clone(),
        );

        Self {
            registry,
            router,
            transport,
            client_queue: config.client_queue,
        }
    }
}
