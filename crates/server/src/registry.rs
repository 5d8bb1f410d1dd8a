//! Client registry
//!
//! Connections are keyed by an opaque [`ConnectionId`] handed out at accept
//! time. Role/name metadata and the live send handle live in two separate
//! tables so routing logic never touches the socket itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Utf8Bytes;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcp_relay_protocol::Role;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames queued for a client's socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// JSON text, relayed as-is
    Text(Utf8Bytes),
    Pong(Bytes),
}

/// Outcome of queueing a frame for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Socket already gone; nothing sent
    Closed,
    /// Client is not draining its queue; frame dropped
    Full,
}

/// Per-connection metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub name: String,
    pub connected_at: DateTime<Utc>,
}

/// Cheap, cloneable send handle for one connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
}

impl ClientHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// A connection is open while its socket writer is still draining.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn deliver(&self, msg: OutboundMessage) -> Delivery {
        if !self.is_open() {
            return Delivery::Closed;
        }
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, ClientInfo>,
    handles: DashMap<ConnectionId, ClientHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection as `Unidentified`.
    pub fn register(&self, tx: mpsc::Sender<OutboundMessage>) -> ConnectionId {
        let id = ConnectionId::next();
        self.clients.insert(
            id,
            ClientInfo {
                id,
                role: Role::Unidentified,
                name: format!("client-{id}"),
                connected_at: Utc::now(),
            },
        );
        self.handles.insert(id, ClientHandle { id, tx });
        id
    }

    /// Overwrite role and name. Returns false if the connection is gone.
    pub fn set_role(&self, id: ConnectionId, role: Role, name: impl Into<String>) -> bool {
        match self.clients.get_mut(&id) {
            Some(mut info) => {
                info.role = role;
                info.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ClientInfo> {
        self.handles.remove(&id);
        self.clients.remove(&id).map(|(_, info)| info)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ClientInfo> {
        self.clients.get(&id).map(|info| info.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Open connections whose current role matches `predicate`.
    ///
    /// Lazy: nothing is resolved until the iterator is driven. Callers that
    /// send must not hold it across an `.await`.
    pub fn by_role<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = ClientHandle> + 'a
    where
        P: Fn(&Role) -> bool + 'a,
    {
        self.clients
            .iter()
            .filter(move |entry| predicate(&entry.role))
            .filter_map(|entry| self.handles.get(entry.key()).map(|h| h.clone()))
            .filter(ClientHandle::is_open)
    }

    /// Every open connection, regardless of role.
    pub fn open_handles(&self) -> Vec<ClientHandle> {
        self.handles
            .iter()
            .map(|entry| entry.value().clone())
            .filter(ClientHandle::is_open)
            .collect()
    }

    /// Connection count per wire role name
    pub fn role_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.clients.iter() {
            *counts.entry(entry.role.as_wire().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();
        clients.sort_by_key(|info| info.id);
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &ClientRegistry) -> (ConnectionId, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (registry.register(tx), rx)
    }

    #[test]
    fn new_connections_start_unidentified() {
        let registry = ClientRegistry::new();
        let (id, _rx) = connect(&registry);

        let info = registry.get(id).expect("registered");
        assert_eq!(info.role, Role::Unidentified);
        assert_eq!(info.name, format!("client-{id}"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn connection_ids_are_unique() {
        let registry = ClientRegistry::new();
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);
        assert_ne!(a, b);
    }

    #[test]
    fn last_identity_wins() {
        let registry = ClientRegistry::new();
        let (id, _rx) = connect(&registry);

        assert!(registry.set_role(id, Role::WebhookListener, "listener"));
        assert!(registry.set_role(id, Role::AiAnalyzer, "analyzer"));
        assert!(registry.set_role(id, Role::AiAnalyzer, "analyzer"));

        let info = registry.get(id).expect("registered");
        assert_eq!(info.role, Role::AiAnalyzer);
        assert_eq!(info.name, "analyzer");
    }

    #[test]
    fn set_role_after_remove_is_a_no_op() {
        let registry = ClientRegistry::new();
        let (id, _rx) = connect(&registry);

        assert!(registry.remove(id).is_some());
        assert!(!registry.set_role(id, Role::AutoCommenter, "late"));
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn by_role_filters_and_skips_closed_connections() {
        let registry = ClientRegistry::new();
        let (commenter, _rc) = connect(&registry);
        let (analyzer, ra) = connect(&registry);
        let (listener, _rl) = connect(&registry);
        registry.set_role(commenter, Role::AutoCommenter, "commenter");
        registry.set_role(analyzer, Role::AiAnalyzer, "analyzer");
        registry.set_role(listener, Role::WebhookListener, "listener");

        let mut ids: Vec<ConnectionId> = registry
            .by_role(Role::receives_webhooks)
            .map(|h| h.id())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![commenter, analyzer]);

        drop(ra);
        let ids: Vec<ConnectionId> = registry
            .by_role(Role::receives_webhooks)
            .map(|h| h.id())
            .collect();
        assert_eq!(ids, vec![commenter]);
    }

    #[test]
    fn deliver_reports_closed_and_full_queues() {
        let registry = ClientRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        let id = registry.register(tx);
        let handle = registry
            .open_handles()
            .into_iter()
            .find(|h| h.id() == id)
            .expect("open handle");

        let msg = OutboundMessage::Text(Utf8Bytes::from_static("{}"));
        assert_eq!(handle.deliver(msg.clone()), Delivery::Queued);
        assert_eq!(handle.deliver(msg.clone()), Delivery::Full);

        drop(rx);
        assert!(!handle.is_open());
        assert_eq!(handle.deliver(msg), Delivery::Closed);
    }

    #[test]
    fn counts_connections_per_role() {
        let registry = ClientRegistry::new();
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);
        let (_c, _rc) = connect(&registry);
        registry.set_role(a, Role::AiAnalyzer, "a");
        registry.set_role(b, Role::Other("release-bot".into()), "b");

        let counts = registry.role_counts();
        assert_eq!(counts.get("ai-analyzer"), Some(&1));
        assert_eq!(counts.get("release-bot"), Some(&1));
        assert_eq!(counts.get("unknown"), Some(&1));
    }
}
