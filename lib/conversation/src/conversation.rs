//! Conversation records.

use crate::agent::AgentType;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use clinic_concierge_core::{ClientId, ConversationId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One chat session between a tenant's visitor and one agent.
///
/// `client_id` and `agent_type` are fixed at creation. Stage, state and
/// activity time change as the conversation progresses; `version` is bumped
/// by every stage or state write and guards those writes against lost
/// updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation identifier.
    pub id: ConversationId,
    /// Owning tenant.
    pub client_id: ClientId,
    /// Owning agent.
    pub agent_type: AgentType,
    /// Current booking stage.
    pub stage: Stage,
    /// Free-form data the stage machine reads and writes.
    pub state: JsonValue,
    /// Optimistic concurrency counter.
    pub version: i64,
    /// Whether the conversation has been finalized.
    pub finalized: bool,
    /// When the conversation was finalized.
    pub finalized_at: Option<DateTime<Utc>>,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// When the conversation last saw a turn or a write.
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates a new, unfinalized conversation with the agent's initial state.
    #[must_use]
    pub fn new(client_id: ClientId, agent_type: AgentType, stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            client_id,
            agent_type,
            stage,
            state: agent_type.initial_state(),
            version: 0,
            finalized: false,
            finalized_at: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Returns true if stage and state writes are still accepted.
    #[must_use]
    pub fn accepts_progress(&self) -> bool {
        !self.finalized && !self.stage.is_terminal()
    }

    /// Returns true if this conversation belongs to the given tenant and agent.
    #[must_use]
    pub fn is_owned_by(&self, client_id: ClientId, agent_type: AgentType) -> bool {
        self.client_id == client_id && self.agent_type == agent_type
    }
}
