//! Fan-out to connected clients.
//!
//! Child output goes to every open connection; webhook merges go to a
//! role-filtered subset. Each send works off a snapshot of the handles, and a
//! handle that closed in the meantime is simply skipped.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use mcp_relay_protocol::Role;
use tracing::{debug, warn};

use crate::registry::{ClientHandle, ClientRegistry, ConnectionId, Delivery, OutboundMessage};
use crate::transport::LineSink;

pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Send `text` verbatim to every open connection. Returns how many queued it.
    pub fn broadcast_all(&self, text: Utf8Bytes) -> usize {
        let targets = self.registry.open_handles();
        self.deliver_each(&targets, &text, "broadcast")
    }

    /// Send `frame` verbatim to every open connection whose role matches,
    /// except `sender`.
    pub fn fan_out<P>(&self, frame: Utf8Bytes, sender: ConnectionId, predicate: P) -> usize
    where
        P: Fn(&Role) -> bool,
    {
        let targets: Vec<ClientHandle> = self
            .registry
            .by_role(predicate)
            .filter(|handle| handle.id() != sender)
            .collect();
        self.deliver_each(&targets, &frame, "fan_out")
    }

    fn deliver_each(&self, targets: &[ClientHandle], text: &Utf8Bytes, kind: &str) -> usize {
        let mut queued = 0;
        for handle in targets {
            match handle.deliver(OutboundMessage::Text(text.clone())) {
                Delivery::Queued => queued += 1,
                Delivery::Closed => {
                    debug!(
                        component = "broadcast",
                        event = "broadcast.skip_closed",
                        connection_id = handle.id().get(),
                        kind,
                        "Skipping closed connection"
                    );
                }
                Delivery::Full => {
                    warn!(
                        component = "broadcast",
                        event = "broadcast.client_lagging",
                        connection_id = handle.id().get(),
                        kind,
                        "Client queue full, frame dropped"
                    );
                }
            }
        }
        queued
    }
}

impl LineSink for Broadcaster {
    fn on_line(&self, line: String) {
        let delivered = self.broadcast_all(Utf8Bytes::from(line));
        debug!(
            component = "broadcast",
            event = "broadcast.child_line",
            delivered,
            "Relayed child output"
        );
    }
}
