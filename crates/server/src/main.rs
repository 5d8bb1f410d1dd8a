//! MCP Relay
//!
//! Bridges WebSocket automation clients (webhook listener, auto-commenter,
//! AI analyzer) to a single MCP server running over stdio.

mod app;
mod broadcast;
mod config;
mod logging;
mod registry;
mod router;
mod state;
mod transport;
mod websocket;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::state::RelayState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let logging = logging::init_logging(config.log_dir.as_deref())?;
    config.validate().context("invalid configuration")?;

    info!(
        component = "main",
        event = "relay.starting",
        version = VERSION,
        log_path = ?logging.log_path,
        content_store = %config.content_store,
        restart = ?config.restart,
        "Starting MCP relay"
    );

    let state = Arc::new(RelayState::new(&config));
    let _supervisor = state.transport.start();

    let app = app::build_app(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        component = "main",
        event = "relay.listening",
        addr = %addr,
        "WebSocket relay listening on ws://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!(component = "main", event = "relay.stopped", "MCP relay stopped");
    drop(logging);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(
            component = "main",
            event = "relay.signal_error",
            error = %e,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}

pub(crate) fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
