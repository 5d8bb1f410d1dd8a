//! Relay → child process requests
//!
//! The child speaks line-delimited JSON-RPC. The relay only ever builds one
//! request of its own: a `tools/call` to `write_file` that persists a webhook
//! event into the content store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::new_id;

pub const JSONRPC_VERSION: &str = "2.0";
pub const TOOLS_CALL_METHOD: &str = "tools/call";
pub const WRITE_FILE_TOOL: &str = "write_file";

/// A JSON-RPC `tools/call` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    pub params: ToolCallParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: new_id(),
            method: TOOLS_CALL_METHOD.to_string(),
            params: ToolCallParams {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn write_file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            WRITE_FILE_TOOL,
            json!({ "path": path.into(), "content": content.into() }),
        )
    }

    /// Request that stores `event` pretty-printed under `content_store`.
    pub fn persist_webhook(
        content_store: &str,
        event: &Value,
        at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let content = serde_json::to_string_pretty(event)?;
        Ok(Self::write_file(
            webhook_artifact_path(content_store, at),
            content,
        ))
    }

    /// Serialize to a single line (no terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `webhook-<timestamp>.json`, with `:` and `.` in the timestamp replaced by `-`.
pub fn webhook_artifact_name(at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("webhook-{stamp}.json")
}

pub fn webhook_artifact_path(content_store: &str, at: DateTime<Utc>) -> String {
    let dir = content_store.trim_end_matches('/');
    let name = webhook_artifact_name(at);
    if dir.is_empty() {
        name
    } else {
        format!("{dir}/{name}")
    }
}
