//! MCP Relay Protocol
//!
//! Wire types shared between the relay and the automation clients that
//! connect to it (webhook listener, auto-commenter, AI analyzer), plus the
//! tool-invocation requests the relay writes to its child process.

use uuid::Uuid;

pub mod client;
pub mod tool;
pub mod types;

pub use client::{classify, ClientIdentity, InboundFrame, WebhookMerge};
pub use tool::{webhook_artifact_name, webhook_artifact_path, ToolCallParams, ToolCallRequest};
pub use types::Role;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
