//! Message routing
//!
//! Every text frame from a client is parsed, classified and handled here:
//! identity frames update the registry, webhook merges are fanned out to the
//! review bots and persisted through the child, JSON-RPC requests are passed
//! through to the child, and everything else is dropped. Nothing here waits
//! on the child's response.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use chrono::Utc;
use mcp_relay_protocol::{classify, InboundFrame, Role, ToolCallRequest, WebhookMerge};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::registry::{ClientRegistry, ConnectionId};
use crate::transport::ChildWriter;
use crate::truncate_for_log;

/// What the router did with one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Identified { role: Role },
    /// Fanned out to `recipients` clients; `queued` if the child accepted the
    /// write request
    WebhookMerged { recipients: usize, queued: bool },
    Forwarded { queued: bool },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidJson,
    Unclassifiable,
}

pub struct MessageRouter {
    registry: Arc<ClientRegistry>,
    broadcaster: Arc<Broadcaster>,
    child: Arc<dyn ChildWriter>,
    content_store: String,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ClientRegistry>,
        broadcaster: Arc<Broadcaster>,
        child: Arc<dyn ChildWriter>,
        content_store: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            child,
            content_store: content_store.into(),
        }
    }

    /// Handle one text frame received from `from`.
    pub fn route(&self, from: ConnectionId, raw: &str) -> RouteOutcome {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    component = "router",
                    event = "router.parse_failed",
                    connection_id = from.get(),
                    error = %e,
                    payload_bytes = raw.len(),
                    payload_preview = %truncate_for_log(raw, 240),
                    "Dropping non-JSON frame"
                );
                return RouteOutcome::Dropped(DropReason::InvalidJson);
            }
        };

        match classify(&value) {
            InboundFrame::Identity(identity) => {
                let role = identity.role();
                self.identify(from, role.clone(), identity.display_name());
                RouteOutcome::Identified { role }
            }
            InboundFrame::WebhookMerge(merge) => self.merge(from, raw, &merge),
            InboundFrame::JsonRpcRequest => RouteOutcome::Forwarded {
                queued: self.forward(from, raw, &value),
            },
            InboundFrame::Unclassifiable => {
                debug!(
                    component = "router",
                    event = "router.unclassifiable",
                    connection_id = from.get(),
                    payload_preview = %truncate_for_log(raw, 240),
                    "Frame is not an identity, merge or JSON-RPC request; dropping"
                );
                RouteOutcome::Dropped(DropReason::Unclassifiable)
            }
        }
    }

    fn identify(&self, from: ConnectionId, role: Role, name: &str) {
        if !self.registry.set_role(from, role.clone(), name) {
            debug!(
                component = "router",
                event = "router.identity.stale",
                connection_id = from.get(),
                "Identity arrived after connection closed"
            );
            return;
        }
        info!(
            component = "router",
            event = "router.identity",
            connection_id = from.get(),
            role = %role,
            client_name = %name,
            clients_by_role = ?self.registry.role_counts(),
            "Client identified"
        );
    }

    fn merge(&self, from: ConnectionId, raw: &str, merge: &WebhookMerge) -> RouteOutcome {
        let recipients = self.broadcaster.fan_out(
            Utf8Bytes::from(raw.to_string()),
            from,
            Role::receives_webhooks,
        );

        let request =
            ToolCallRequest::persist_webhook(&self.content_store, merge.event(), Utc::now())
                .and_then(|request| Ok((request.to_line()?, request)));

        let queued = match request {
            Ok((line, request)) => {
                info!(
                    component = "router",
                    event = "router.webhook.persist",
                    connection_id = from.get(),
                    sender_role = ?self.registry.get(from).map(|info| info.role.to_string()),
                    recipients,
                    request_id = %request.id,
                    path = %request.params.arguments["path"],
                    "Fanned out webhook, handing write_file to child"
                );
                self.child.write_line(line)
            }
            Err(e) => {
                warn!(
                    component = "router",
                    event = "router.webhook.serialize_failed",
                    connection_id = from.get(),
                    error = %e,
                    "Could not build write_file request for webhook"
                );
                false
            }
        };

        RouteOutcome::WebhookMerged { recipients, queued }
    }

    fn forward(&self, from: ConnectionId, raw: &str, value: &Value) -> bool {
        debug!(
            component = "router",
            event = "router.forward",
            connection_id = from.get(),
            method = ?value.get("method"),
            id = ?value.get("id"),
            "Forwarding JSON-RPC request to child"
        );
        // The child reads one document per line.
        if raw.contains(['\n', '\r']) {
            match serde_json::to_string(value) {
                Ok(line) => self.child.write_line(line),
                Err(e) => {
                    warn!(
                        component = "router",
                        event = "router.forward.serialize_failed",
                        connection_id = from.get(),
                        error = %e,
                        "Could not compact multi-line request"
                    );
                    false
                }
            }
        } else {
            self.child.write_line(raw.to_string())
        }
    }
}
