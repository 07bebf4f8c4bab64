//! Message log entries.

use crate::agent::AgentType;
use chrono::{DateTime, Utc};
use clinic_concierge_core::{ConversationId, MessageSeq};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// The human on the other side of the widget.
    User,
    /// The agent.
    Assistant,
}

impl SenderRole {
    /// Returns the persisted name of this role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            // Rows written before the role was renamed use "bot".
            "assistant" | "bot" => Ok(Self::Assistant),
            other => Err(format!("unknown sender role '{other}'")),
        }
    }
}

/// An append request for the message log.
///
/// The agent type is supplied by the caller and stamped onto the entry
/// verbatim. The log never derives it from the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Agent the entry is tagged with.
    pub agent_type: AgentType,
    /// Sender role.
    pub sender: SenderRole,
    /// Text content.
    pub content: String,
    /// How long the assistant took to respond, in milliseconds.
    pub latency_ms: Option<i32>,
}

impl NewMessage {
    /// Creates an append request.
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        agent_type: AgentType,
        sender: SenderRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            agent_type,
            sender,
            content: content.into(),
            latency_ms: None,
        }
    }

    /// Attaches a response latency measurement.
    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: i32) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// An immutable entry in the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Log position, strictly increasing in insertion order.
    pub seq: MessageSeq,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Agent the entry was tagged with at write time.
    pub agent_type: AgentType,
    /// Sender role.
    pub sender: SenderRole,
    /// Text content.
    pub content: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// Response latency in milliseconds, if measured.
    pub latency_ms: Option<i32>,
}
