//! Client → Relay frames
//!
//! Clients send free-form JSON documents. The relay does not deserialize
//! them into a closed enum: each document is inspected for a handful of
//! discriminator fields and classified, first match wins.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Role;

/// `type` value of an identity announcement
pub const IDENTITY_TYPE: &str = "client-identity";

/// `op` value of a webhook merge update
pub const MERGE_OP: &str = "merge";

/// Display name used when an identity frame omits `clientName`
pub const UNNAMED_CLIENT: &str = "unnamed";

/// Result of classifying one inbound document
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `{"type":"client-identity","clientType":..,"clientName":..}`
    Identity(ClientIdentity),
    /// `{"op":"merge","payload":{..}}`
    WebhookMerge(WebhookMerge),
    /// Any document carrying both `jsonrpc` and `method`
    JsonRpcRequest,
    Unclassifiable,
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Identity(_) => "identity",
            InboundFrame::WebhookMerge(_) => "webhook_merge",
            InboundFrame::JsonRpcRequest => "jsonrpc_request",
            InboundFrame::Unclassifiable => "unclassifiable",
        }
    }
}

/// Identity announcement sent by a client right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "clientType", default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(rename = "clientName", default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl ClientIdentity {
    pub fn role(&self) -> Role {
        self.client_type
            .as_deref()
            .map(Role::from_wire)
            .unwrap_or_default()
    }

    pub fn display_name(&self) -> &str {
        self.client_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(UNNAMED_CLIENT)
    }

    fn from_value(value: &Value) -> Self {
        Self {
            kind: IDENTITY_TYPE.to_string(),
            client_type: non_empty_str(value, "clientType"),
            client_name: non_empty_str(value, "clientName"),
        }
    }
}

/// Webhook update pushed by the webhook listener.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookMerge {
    pub payload: Value,
}

impl WebhookMerge {
    /// The event object to persist: `payload.github` when present, otherwise
    /// the whole payload.
    pub fn event(&self) -> &Value {
        self.payload.get("github").unwrap_or(&self.payload)
    }
}

/// Classify a parsed document. Identity beats merge beats JSON-RPC.
pub fn classify(value: &Value) -> InboundFrame {
    if value.get("type").and_then(Value::as_str) == Some(IDENTITY_TYPE) {
        return InboundFrame::Identity(ClientIdentity::from_value(value));
    }

    if value.get("op").and_then(Value::as_str) == Some(MERGE_OP) {
        return InboundFrame::WebhookMerge(WebhookMerge {
            payload: value.get("payload").cloned().unwrap_or(Value::Null),
        });
    }

    if is_present(value.get("jsonrpc")) && is_present(value.get("method")) {
        return InboundFrame::JsonRpcRequest;
    }

    InboundFrame::Unclassifiable
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A field counts as present unless it is missing, null, false, zero or "".
fn is_present(field: Option<&Value>) -> bool {
    match field {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
