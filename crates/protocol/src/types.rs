//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared category of a connected client.
///
/// Serialized as the bare wire string clients announce in `clientType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    /// No identity frame received yet (wire: `unknown`)
    #[default]
    Unidentified,
    WebhookListener,
    AutoCommenter,
    AiAnalyzer,
    /// Any role string the relay has no policy for
    Other(String),
}

impl Role {
    pub const UNKNOWN: &'static str = "unknown";
    pub const WEBHOOK_LISTENER: &'static str = "webhook-listener";
    pub const AUTO_COMMENTER: &'static str = "auto-commenter";
    pub const AI_ANALYZER: &'static str = "ai-analyzer";

    /// Map an announced `clientType` to a role. Empty strings count as unknown.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "" | Self::UNKNOWN => Role::Unidentified,
            Self::WEBHOOK_LISTENER => Role::WebhookListener,
            Self::AUTO_COMMENTER => Role::AutoCommenter,
            Self::AI_ANALYZER => Role::AiAnalyzer,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Role::Unidentified => Self::UNKNOWN,
            Role::WebhookListener => Self::WEBHOOK_LISTENER,
            Role::AutoCommenter => Self::AUTO_COMMENTER,
            Role::AiAnalyzer => Self::AI_ANALYZER,
            Role::Other(name) => name,
        }
    }

    /// Roles that receive webhook merge frames from other clients.
    pub fn receives_webhooks(&self) -> bool {
        matches!(self, Role::AutoCommenter | Role::AiAnalyzer)
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::from_wire(&value)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_wire().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}
