//! HTTP surface: the WebSocket endpoint plus health, status and child control.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::registry::ClientInfo;
use crate::state::RelayState;
use crate::transport::{ChildStatus, RestartRequest};
use crate::websocket::ws_handler;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub child: ChildStatus,
    /// Whether writes to the child currently go anywhere
    pub child_writable: bool,
    pub clients: ClientsStatus,
}

#[derive(Debug, Serialize)]
pub struct ClientsStatus {
    pub total: usize,
    pub by_role: BTreeMap<String, usize>,
    pub connections: Vec<ClientInfo>,
}

pub fn build_app(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/child/restart", post(restart_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn status_handler(State(state): State<Arc<RelayState>>) -> Json<StatusResponse> {
    let connections = state.registry.snapshot();
    Json(StatusResponse {
        child: state.transport.status().as_ref().clone(),
        child_writable: state.transport.is_writable(),
        clients: ClientsStatus {
            total: connections.len(),
            by_role: state.registry.role_counts(),
            connections,
        },
    })
}

async fn restart_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    match state.transport.request_restart() {
        RestartRequest::Accepted => (StatusCode::ACCEPTED, "restart requested"),
        RestartRequest::AlreadyRunning => (StatusCode::CONFLICT, "child is already running"),
        RestartRequest::NotStarted => (StatusCode::CONFLICT, "child has not been started yet"),
        RestartRequest::Pending => (StatusCode::CONFLICT, "a restart is already pending"),
        RestartRequest::Disabled => (
            StatusCode::CONFLICT,
            "restart policy does not allow manual restarts",
        ),
    }
}
