//! Persistence ports.
//!
//! The state manager is written against these traits. Implementations must
//! make each method a single atomic operation against durable storage; the
//! manager holds no state between calls and relies on the store for
//! per-conversation serialization.

use crate::client::Client;
use crate::conversation::Conversation;
use crate::error::StoreError;
use crate::filter::HistoryFilter;
use crate::message::{Message, NewMessage};
use crate::stage::Stage;
use crate::agent::AgentType;
use async_trait::async_trait;
use clinic_concierge_core::{ClientId, ConversationId};
use serde_json::Value as JsonValue;

/// Result of a finalize call.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// This call finalized the conversation.
    Finalized(Conversation),
    /// The conversation was already finalized; nothing changed.
    AlreadyFinalized(Conversation),
}

impl FinalizeOutcome {
    /// The conversation as persisted after the call.
    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        match self {
            Self::Finalized(c) | Self::AlreadyFinalized(c) => c,
        }
    }

    /// Returns true if this call performed the transition.
    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Storage for conversation records.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates an unfinalized conversation for a client and agent.
    ///
    /// Fails with `Duplicate` on id collision and `UnknownClient` if the
    /// client does not exist.
    async fn create_conversation(
        &self,
        client_id: ClientId,
        agent_type: AgentType,
        initial_stage: Stage,
    ) -> Result<Conversation, StoreError>;

    /// Loads a conversation by id, without any ownership filtering.
    async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Overwrites stage and state if the stored version still equals
    /// `expected_version`.
    ///
    /// Bumps the version and refreshes last activity. Writing
    /// [`Stage::Finalized`] also sets the finalized flag. Fails with
    /// `AlreadyFinalized` if the conversation is finalized and with
    /// `ConcurrentModification` if the version moved.
    async fn update_stage(
        &self,
        id: ConversationId,
        expected_version: i64,
        stage: Stage,
        state: JsonValue,
    ) -> Result<Conversation, StoreError>;

    /// Marks a conversation finalized. Idempotent.
    async fn finalize(&self, id: ConversationId) -> Result<FinalizeOutcome, StoreError>;

    /// Lists a client's finalized conversations, most recently finalized first.
    async fn list_finalized(&self, client_id: ClientId) -> Result<Vec<Conversation>, StoreError>;
}

/// Append-only storage for message log entries.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Appends one entry, stamped with the caller-supplied agent type.
    ///
    /// Refreshes the owning conversation's last activity in the same write.
    /// Fails with `UnknownConversation` if the conversation does not exist.
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Returns up to `limit` entries visible under `filter`, most recent
    /// first.
    async fn query_scoped(
        &self,
        filter: &HistoryFilter,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    /// Returns up to `limit` entries of a conversation regardless of agent
    /// type, most recent first. Administrative use only.
    async fn query_unscoped(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Read-only access to tenant records.
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    /// Loads a client by id.
    async fn load_client(&self, id: ClientId) -> Result<Option<Client>, StoreError>;
}
