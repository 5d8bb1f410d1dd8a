//! WebSocket handling

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionId, OutboundMessage};
use crate::router::RouteOutcome;
use crate::state::RelayState;
use crate::truncate_for_log;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for frames headed to this client (broadcasts, fan-out, pongs)
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(state.client_queue);
    let conn_id = state.registry.register(outbound_tx.clone());

    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id.get(),
        total_clients = state.registry.len(),
        "WebSocket connection opened"
    );

    // Spawn task to forward queued frames to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Text(text) => ws_tx.send(Message::Text(text)).await,
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id.get(),
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Frames from one connection are routed strictly in receipt order
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                route_frame(&state, conn_id, text.as_str());
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => route_frame(&state, conn_id, text),
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.message.invalid_utf8",
                        connection_id = conn_id.get(),
                        error = %e,
                        payload_bytes = data.len(),
                        "Dropping binary frame that is not UTF-8"
                    );
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.try_send(OutboundMessage::Pong(data));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id.get(),
                    "Client sent close frame"
                );
                break;
            }
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id.get(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    let info = state.registry.remove(conn_id);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id.get(),
        role = ?info.as_ref().map(|i| i.role.to_string()),
        total_clients = state.registry.len(),
        "WebSocket connection closed"
    );
    if state.registry.is_empty() {
        debug!(
            component = "websocket",
            event = "ws.registry.empty",
            "Last client disconnected"
        );
    }
    send_task.abort();
}

fn route_frame(state: &RelayState, conn_id: ConnectionId, text: &str) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = conn_id.get(),
        payload_bytes = text.len(),
        payload_preview = %truncate_for_log(text, 100),
        "Frame received"
    );
    let (outcome, detail) = match state.router.route(conn_id, text) {
        RouteOutcome::Identified { role } => ("identified", role.to_string()),
        RouteOutcome::WebhookMerged { recipients, queued } => (
            "webhook_merged",
            format!("recipients={recipients} queued={queued}"),
        ),
        RouteOutcome::Forwarded { queued } => ("forwarded", format!("queued={queued}")),
        RouteOutcome::Dropped(reason) => ("dropped", format!("{reason:?}")),
    };
    debug!(
        component = "websocket",
        event = "ws.message.routed",
        connection_id = conn_id.get(),
        outcome,
        detail = %detail,
        "Frame routed"
    );
}
