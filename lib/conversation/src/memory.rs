//! In-memory persistence.
//!
//! Implements every port over a single mutex-guarded state, so each call is
//! atomic with respect to every other. Intended for tests and local
//! development; nothing survives the process.

use crate::agent::AgentType;
use crate::client::Client;
use crate::conversation::Conversation;
use crate::error::StoreError;
use crate::filter::{HistoryFilter, sort_most_recent_first};
use crate::message::{Message, NewMessage};
use crate::stage::Stage;
use crate::store::{ClientDirectory, ConversationStore, FinalizeOutcome, MessageLog};
use async_trait::async_trait;
use chrono::Utc;
use clinic_concierge_core::{ClientId, ConversationId, MessageSeq};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    clients: HashMap<ClientId, Client>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: Vec<Message>,
    next_seq: i64,
}

/// Port implementation backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tenant so conversations can be created for it.
    pub fn insert_client(&self, client: Client) {
        if let Ok(mut state) = self.state.lock() {
            state.clients.insert(client.id, client);
        }
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of entries in the log, across all conversations.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    /// Number of conversation records.
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.conversations.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            });
        }
        self.state.lock().map_err(|_| StoreError::Unavailable {
            reason: "in-memory store lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(
        &self,
        client_id: ClientId,
        agent_type: AgentType,
        initial_stage: Stage,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.lock()?;
        if !state.clients.contains_key(&client_id) {
            return Err(StoreError::UnknownClient { id: client_id });
        }

        let conversation = Conversation::new(client_id, agent_type, initial_stage);
        if state.conversations.contains_key(&conversation.id) {
            return Err(StoreError::Duplicate {
                id: conversation.id,
            });
        }
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.lock()?.conversations.get(&id).cloned())
    }

    async fn update_stage(
        &self,
        id: ConversationId,
        expected_version: i64,
        stage: Stage,
        state_blob: JsonValue,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.lock()?;
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound { id })?;

        if !conversation.accepts_progress() {
            return Err(StoreError::AlreadyFinalized { id });
        }
        if conversation.version != expected_version {
            return Err(StoreError::ConcurrentModification {
                id,
                expected_version,
            });
        }

        let now = Utc::now();
        conversation.stage = stage;
        conversation.state = state_blob;
        conversation.version += 1;
        conversation.last_activity_at = now;
        if stage.is_terminal() {
            conversation.finalized = true;
            conversation.finalized_at = Some(now);
        }
        Ok(conversation.clone())
    }

    async fn finalize(&self, id: ConversationId) -> Result<FinalizeOutcome, StoreError> {
        let mut state = self.lock()?;
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound { id })?;

        if conversation.finalized {
            return Ok(FinalizeOutcome::AlreadyFinalized(conversation.clone()));
        }

        let now = Utc::now();
        conversation.finalized = true;
        conversation.finalized_at = Some(now);
        conversation.last_activity_at = now;
        conversation.version += 1;
        Ok(FinalizeOutcome::Finalized(conversation.clone()))
    }

    async fn list_finalized(&self, client_id: ClientId) -> Result<Vec<Conversation>, StoreError> {
        let state = self.lock()?;
        let mut leads: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.client_id == client_id && c.finalized)
            .cloned()
            .collect();
        leads.sort_by(|a, b| b.finalized_at.cmp(&a.finalized_at));
        Ok(leads)
    }
}

#[async_trait]
impl MessageLog for InMemoryStore {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let conversation = state
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or(StoreError::UnknownConversation {
                id: message.conversation_id,
            })?;
        conversation.last_activity_at = now;

        state.next_seq += 1;
        let entry = Message {
            seq: MessageSeq::new(state.next_seq),
            conversation_id: message.conversation_id,
            agent_type: message.agent_type,
            sender: message.sender,
            content: message.content,
            created_at: now,
            latency_ms: message.latency_ms,
        };
        state.messages.push(entry.clone());
        Ok(entry)
    }

    async fn query_scoped(
        &self,
        filter: &HistoryFilter,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.lock()?;
        let mut visible: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_most_recent_first(&mut visible);
        visible.truncate(limit as usize);
        Ok(visible)
    }

    async fn query_unscoped(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.lock()?;
        let mut all: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        sort_most_recent_first(&mut all);
        all.truncate(limit as usize);
        Ok(all)
    }
}

#[async_trait]
impl ClientDirectory for InMemoryStore {
    async fn load_client(&self, id: ClientId) -> Result<Option<Client>, StoreError> {
        Ok(self.lock()?.clients.get(&id).cloned())
    }
}
