//! History isolation filter.
//!
//! A [`HistoryFilter`] pairs a conversation with the agent the read is made
//! for. It cannot be built without an agent type, and the scoped query on
//! [`MessageLog`](crate::store::MessageLog) only accepts a filter, so every
//! production history read is scoped.
//!
//! The predicate is applied to the agent type stamped on each message, not
//! to the owning conversation's agent type. Storage adapters must evaluate
//! it before applying the limit.

use crate::agent::AgentType;
use crate::message::Message;
use clinic_concierge_core::ConversationId;
use serde::Serialize;
use std::cmp::Reverse;

/// Scope of an agent-visible history read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryFilter {
    conversation_id: ConversationId,
    agent_type: AgentType,
}

impl HistoryFilter {
    /// Scopes a read to one conversation and one agent.
    #[must_use]
    pub const fn new(conversation_id: ConversationId, agent_type: AgentType) -> Self {
        Self {
            conversation_id,
            agent_type,
        }
    }

    /// The conversation being read.
    #[must_use]
    pub const fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// The agent the read is made for.
    #[must_use]
    pub const fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    /// Returns true if `message` is visible under this filter.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        message.conversation_id == self.conversation_id && message.agent_type == self.agent_type
    }
}

/// Who is reading unscoped history, and why.
///
/// Required by the privileged history entry point and written to the
/// `audit` log target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryAudit {
    /// Operator or service performing the read.
    pub actor: String,
    /// Free-form justification.
    pub reason: String,
}

impl HistoryAudit {
    /// Creates an audit record.
    #[must_use]
    pub fn new(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            reason: reason.into(),
        }
    }
}

/// Sorts messages most recent first, ties broken by descending sequence.
pub fn sort_most_recent_first(messages: &mut [Message]) {
    messages.sort_by_key(|m| Reverse((m.created_at, m.seq)));
}
