//! Conversation state manager.
//!
//! The orchestrator request handlers call into. It composes the persistence
//! ports with the isolation filter and the stage machine, holds no
//! conversation state of its own between calls, and is safe to share across
//! any number of concurrent handlers.

use crate::agent::AgentType;
use crate::client::Client;
use crate::config::ManagerConfig;
use crate::conversation::Conversation;
use crate::error::{ConversationError, StoreError};
use crate::filter::{HistoryAudit, HistoryFilter};
use crate::message::{Message, NewMessage, SenderRole};
use crate::stage::Stage;
use crate::store::{ClientDirectory, ConversationStore, MessageLog};
use clinic_concierge_core::{ClientId, ConversationId, Result};
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

fn lift(err: StoreError) -> Report<ConversationError> {
    ConversationError::from(err).into()
}

/// Emits the lead event for a conversation that just became finalized.
fn log_lead_finalized(conversation: &Conversation) {
    info!(
        target: "leads",
        conversation_id = %conversation.id,
        client_id = %conversation.client_id,
        agent_type = %conversation.agent_type,
        finalized_at = ?conversation.finalized_at,
        collected = %conversation.state,
        "lead finalized"
    );
}

/// Orchestrates conversation lifecycle, turn logging and history reads.
#[derive(Clone)]
pub struct StateManager {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageLog>,
    clients: Arc<dyn ClientDirectory>,
    config: ManagerConfig,
}

impl StateManager {
    /// Creates a manager over separate port implementations.
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageLog>,
        clients: Arc<dyn ClientDirectory>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            conversations,
            messages,
            clients,
            config,
        }
    }

    /// Creates a manager over a single store implementing every port.
    pub fn from_store<S>(store: Arc<S>, config: ManagerConfig) -> Self
    where
        S: ConversationStore + MessageLog + ClientDirectory + 'static,
    {
        Self::new(store.clone(), store.clone(), store, config)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Loads the conversation named by `conversation_id`, or starts a new one.
    ///
    /// An existing conversation is only returned if it belongs to both the
    /// requesting client and the requesting agent; anything else is an
    /// error and is never re-scoped. If no id is given, or the id does not
    /// resolve, a new conversation is created in [`Stage::Greeting`] under a
    /// freshly generated id.
    #[instrument(skip(self), fields(client_id = %client_id, agent_type = %agent_type))]
    pub async fn load_or_create_conversation(
        &self,
        client_id: ClientId,
        conversation_id: Option<ConversationId>,
        agent_type: AgentType,
    ) -> Result<Conversation, ConversationError> {
        if let Some(id) = conversation_id
            && let Some(existing) = self.conversations.load_conversation(id).await.map_err(lift)?
        {
            if existing.is_owned_by(client_id, agent_type) {
                return Ok(existing);
            }
            // Tenant mismatch takes precedence over agent mismatch.
            if existing.client_id != client_id {
                warn!(conversation_id = %id, "rejected conversation load across clients");
                return Err(ConversationError::ClientMismatch {
                    id,
                    expected: client_id,
                    actual: existing.client_id,
                }
                .into());
            }
            warn!(
                conversation_id = %id,
                owner = %existing.agent_type,
                "rejected conversation load across agent types"
            );
            return Err(ConversationError::AgentTypeMismatch {
                id,
                expected: agent_type,
                actual: existing.agent_type,
            }
            .into());
        }

        let created = self
            .conversations
            .create_conversation(client_id, agent_type, Stage::Greeting)
            .await
            .map_err(lift)?;
        info!(conversation_id = %created.id, "created conversation");
        Ok(created)
    }

    /// Appends one turn, tagged with `agent_type`.
    ///
    /// The conversation must exist and be owned by `agent_type`. Appends are
    /// accepted after finalization.
    #[instrument(skip(self, text), fields(conversation_id = %conversation_id, agent_type = %agent_type))]
    pub async fn record_turn(
        &self,
        conversation_id: ConversationId,
        agent_type: AgentType,
        sender: SenderRole,
        text: &str,
        latency_ms: Option<i32>,
    ) -> Result<Message, ConversationError> {
        let conversation = self.require(conversation_id).await?;
        if conversation.agent_type != agent_type {
            warn!(owner = %conversation.agent_type, "rejected turn across agent types");
            return Err(ConversationError::AgentTypeMismatch {
                id: conversation_id,
                expected: agent_type,
                actual: conversation.agent_type,
            }
            .into());
        }

        let mut message = NewMessage::new(conversation_id, agent_type, sender, text);
        message.latency_ms = latency_ms;
        let written = self.messages.append(message).await.map_err(lift)?;
        debug!(seq = %written.seq, sender = %sender, "recorded turn");
        Ok(written)
    }

    /// Returns up to `limit` of the most recent messages visible to
    /// `agent_type`, most recent first.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, agent_type = %agent_type))]
    pub async fn get_scoped_history(
        &self,
        conversation_id: ConversationId,
        agent_type: AgentType,
        limit: u32,
    ) -> Result<Vec<Message>, ConversationError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = HistoryFilter::new(conversation_id, agent_type);
        self.messages
            .query_scoped(&filter, limit)
            .await
            .map_err(lift)
    }

    /// [`get_scoped_history`](Self::get_scoped_history) with the configured
    /// default length.
    pub async fn get_recent_history(
        &self,
        conversation_id: ConversationId,
        agent_type: AgentType,
    ) -> Result<Vec<Message>, ConversationError> {
        self.get_scoped_history(conversation_id, agent_type, self.config.default_history_limit)
            .await
    }

    /// Returns a conversation's history across every agent type.
    ///
    /// Privileged: bypasses the isolation filter. Every call is written to
    /// the `audit` log target before storage is touched.
    #[instrument(skip(self, audit), fields(conversation_id = %conversation_id))]
    pub async fn get_unscoped_history_privileged(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        audit: &HistoryAudit,
    ) -> Result<Vec<Message>, ConversationError> {
        warn!(
            target: "audit",
            conversation_id = %conversation_id,
            actor = %audit.actor,
            reason = %audit.reason,
            limit,
            "privileged unscoped history read"
        );
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.messages
            .query_unscoped(conversation_id, limit)
            .await
            .map_err(lift)
    }

    /// Moves a conversation to `requested` and replaces its state blob.
    ///
    /// Only forward transitions are accepted. Writes that lose to a
    /// concurrent writer are re-read, re-validated and retried up to
    /// `max_update_attempts` times.
    #[instrument(skip(self, state), fields(conversation_id = %conversation_id, requested = %requested))]
    pub async fn advance_stage(
        &self,
        conversation_id: ConversationId,
        requested: Stage,
        state: JsonValue,
    ) -> Result<Conversation, ConversationError> {
        let updated = self
            .write_with_retry(conversation_id, state, |current| {
                if current.stage.can_transition_to(requested) {
                    Ok(requested)
                } else {
                    Err(ConversationError::InvalidTransition {
                        id: conversation_id,
                        from: current.stage,
                        to: requested,
                    })
                }
            })
            .await?;
        info!(stage = %updated.stage, version = updated.version, "advanced stage");
        // A successful write only applies to an unfinalized conversation, so
        // a finalized result means this call performed the transition.
        if updated.finalized {
            log_lead_finalized(&updated);
        }
        Ok(updated)
    }

    /// Replaces a conversation's state blob without changing its stage.
    #[instrument(skip(self, state), fields(conversation_id = %conversation_id))]
    pub async fn update_state(
        &self,
        conversation_id: ConversationId,
        state: JsonValue,
    ) -> Result<Conversation, ConversationError> {
        self.write_with_retry(conversation_id, state, |current| Ok(current.stage))
            .await
    }

    /// Marks a conversation finalized.
    ///
    /// Idempotent. The lead-finalized event is logged only by the call that
    /// actually performs the transition.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn finalize_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ConversationError> {
        let outcome = self
            .conversations
            .finalize(conversation_id)
            .await
            .map_err(lift)?;

        if outcome.is_new() {
            log_lead_finalized(outcome.conversation());
        } else {
            debug!("conversation already finalized");
        }
        Ok(())
    }

    /// Lists a client's finalized conversations, most recent first.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn list_leads(&self, client_id: ClientId) -> Result<Vec<Conversation>, ConversationError> {
        self.conversations
            .list_finalized(client_id)
            .await
            .map_err(lift)
    }

    /// Loads a tenant record.
    pub async fn load_client(&self, client_id: ClientId) -> Result<Option<Client>, ConversationError> {
        self.clients.load_client(client_id).await.map_err(lift)
    }

    async fn require(&self, id: ConversationId) -> Result<Conversation, ConversationError> {
        self.conversations
            .load_conversation(id)
            .await
            .map_err(lift)?
            .ok_or_else(|| ConversationError::NotFound { id }.into())
    }

    async fn write_with_retry<F>(
        &self,
        id: ConversationId,
        state: JsonValue,
        next_stage: F,
    ) -> Result<Conversation, ConversationError>
    where
        F: Fn(&Conversation) -> std::result::Result<Stage, ConversationError>,
    {
        let attempts = self.config.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self.require(id).await?;
            if !current.accepts_progress() {
                return Err(ConversationError::AlreadyFinalized { id }.into());
            }
            let stage = next_stage(&current)?;

            match self
                .conversations
                .update_stage(id, current.version, stage, state.clone())
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(StoreError::ConcurrentModification { .. }) => {
                    debug!(attempt, version = current.version, "lost write race");
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(lift(err)),
            }
        }

        warn!(conversation_id = %id, attempts, "giving up after repeated concurrent modification");
        Err(ConversationError::ConcurrentModification { id, attempts }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::store::FinalizeOutcome;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::fmt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Debug, Clone)]
    struct CapturedEvent {
        target: String,
        fields: HashMap<String, String>,
    }

    /// Records every event emitted while installed as the default subscriber.
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<Mutex<Vec<CapturedEvent>>>);

    impl CapturedEvents {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
        }

        fn for_target(&self, target: &str) -> Vec<CapturedEvent> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.target == target)
                .cloned()
                .collect()
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for CapturedEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = FieldRecorder::default();
            event.record(&mut fields);
            self.0.lock().unwrap().push(CapturedEvent {
                target: event.metadata().target().to_string(),
                fields: fields.0,
            });
        }
    }

    #[derive(Default)]
    struct FieldRecorder(HashMap<String, String>);

    impl Visit for FieldRecorder {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        manager: StateManager,
        client: ClientId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let client = Client::new("Riverside Dental");
        let client_id = client.id;
        store.insert_client(client);
        let manager = StateManager::from_store(store.clone(), ManagerConfig::default());
        Fixture {
            store,
            manager,
            client: client_id,
        }
    }

    fn kind<T: std::fmt::Debug>(result: Result<T, ConversationError>) -> ConversationError {
        result.expect_err("expected failure").current_context().clone()
    }

    async fn patient_conversation(f: &Fixture) -> Conversation {
        f.manager
            .load_or_create_conversation(f.client, None, AgentType::Patient)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creates_conversation_in_greeting() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        assert_eq!(c.stage, Stage::Greeting);
        assert_eq!(c.agent_type, AgentType::Patient);
        assert_eq!(c.client_id, f.client);
        assert!(!c.finalized);
        assert_eq!(c.state, AgentType::Patient.initial_state());
    }

    #[tokio::test]
    async fn load_or_create_is_idempotent_for_existing_id() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        for _ in 0..3 {
            let again = f
                .manager
                .load_or_create_conversation(f.client, Some(c.id), AgentType::Patient)
                .await
                .unwrap();
            assert_eq!(again.id, c.id);
        }
        assert_eq!(f.store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn unresolved_id_starts_a_new_conversation() {
        let f = fixture();
        let stale = ConversationId::new();
        let c = f
            .manager
            .load_or_create_conversation(f.client, Some(stale), AgentType::Clinical)
            .await
            .unwrap();

        assert_ne!(c.id, stale);
        assert_eq!(c.agent_type, AgentType::Clinical);
    }

    #[tokio::test]
    async fn load_across_agent_types_is_rejected() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        let err = kind(
            f.manager
                .load_or_create_conversation(f.client, Some(c.id), AgentType::Clinical)
                .await,
        );
        assert_eq!(
            err,
            ConversationError::AgentTypeMismatch {
                id: c.id,
                expected: AgentType::Clinical,
                actual: AgentType::Patient,
            }
        );
        assert_eq!(f.store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn load_across_clients_is_rejected() {
        let f = fixture();
        let other = Client::new("Hillside Ortho");
        let other_id = other.id;
        f.store.insert_client(other);
        let c = patient_conversation(&f).await;

        let err = kind(
            f.manager
                .load_or_create_conversation(other_id, Some(c.id), AgentType::Patient)
                .await,
        );
        assert!(matches!(err, ConversationError::ClientMismatch { .. }));
    }

    #[tokio::test]
    async fn other_client_sees_client_mismatch_even_with_wrong_agent() {
        let f = fixture();
        let other = Client::new("Hillside Ortho");
        let other_id = other.id;
        f.store.insert_client(other);
        let c = patient_conversation(&f).await;

        let err = kind(
            f.manager
                .load_or_create_conversation(other_id, Some(c.id), AgentType::Clinical)
                .await,
        );
        assert_eq!(
            err,
            ConversationError::ClientMismatch {
                id: c.id,
                expected: other_id,
                actual: f.client,
            }
        );
    }

    #[tokio::test]
    async fn unknown_client_cannot_start_conversations() {
        let f = fixture();
        let err = kind(
            f.manager
                .load_or_create_conversation(ClientId::new(), None, AgentType::Patient)
                .await,
        );
        assert!(matches!(err, ConversationError::UnknownClient { .. }));
    }

    #[tokio::test]
    async fn record_turn_stamps_supplied_agent_type() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        let msg = f
            .manager
            .record_turn(c.id, AgentType::Patient, SenderRole::User, "I need a cleaning", None)
            .await
            .unwrap();
        assert_eq!(msg.agent_type, AgentType::Patient);
        assert_eq!(msg.conversation_id, c.id);

        let reply = f
            .manager
            .record_turn(c.id, AgentType::Patient, SenderRole::Assistant, "Sure!", Some(840))
            .await
            .unwrap();
        assert_eq!(reply.latency_ms, Some(840));
    }

    #[tokio::test]
    async fn record_turn_across_agent_types_writes_nothing() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        let err = kind(
            f.manager
                .record_turn(c.id, AgentType::Clinical, SenderRole::User, "leak?", None)
                .await,
        );
        assert!(matches!(err, ConversationError::AgentTypeMismatch { .. }));
        assert_eq!(f.store.message_count(), 0);
    }

    #[tokio::test]
    async fn record_turn_on_missing_conversation_is_not_found() {
        let f = fixture();
        let id = ConversationId::new();
        let err = kind(
            f.manager
                .record_turn(id, AgentType::Patient, SenderRole::User, "hello", None)
                .await,
        );
        assert_eq!(err, ConversationError::NotFound { id });
    }

    #[tokio::test]
    async fn injected_cross_agent_message_never_mixes_into_history() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        for text in ["hi", "book me in", "tuesday works"] {
            f.manager
                .record_turn(c.id, AgentType::Patient, SenderRole::User, text, None)
                .await
                .unwrap();
        }
        // Bypass the manager and write straight to the log.
        f.store
            .append(NewMessage::new(
                c.id,
                AgentType::Clinical,
                SenderRole::User,
                "clinical note",
            ))
            .await
            .unwrap();

        let patient = f
            .manager
            .get_scoped_history(c.id, AgentType::Patient, 10)
            .await
            .unwrap();
        let clinical = f
            .manager
            .get_scoped_history(c.id, AgentType::Clinical, 10)
            .await
            .unwrap();

        assert_eq!(patient.len(), 3);
        assert!(patient.iter().all(|m| m.agent_type == AgentType::Patient));
        assert_eq!(clinical.len(), 1);
        assert_eq!(clinical[0].content, "clinical note");

        let patient_seqs: HashSet<_> = patient.iter().map(|m| m.seq).collect();
        assert!(clinical.iter().all(|m| !patient_seqs.contains(&m.seq)));
    }

    #[tokio::test]
    async fn limit_applies_after_filtering() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        f.manager
            .record_turn(c.id, AgentType::Patient, SenderRole::User, "mine", None)
            .await
            .unwrap();
        for i in 0..5 {
            f.store
                .append(NewMessage::new(
                    c.id,
                    AgentType::Clinical,
                    SenderRole::Assistant,
                    format!("other {i}"),
                ))
                .await
                .unwrap();
        }

        let history = f
            .manager
            .get_scoped_history(c.id, AgentType::Patient, 1)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "mine");
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_bounded() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        for i in 0..4 {
            f.manager
                .record_turn(c.id, AgentType::Patient, SenderRole::User, &format!("t{i}"), None)
                .await
                .unwrap();
        }

        let history = f
            .manager
            .get_scoped_history(c.id, AgentType::Patient, 3)
            .await
            .unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["t3", "t2", "t1"]);

        assert!(
            f.manager
                .get_scoped_history(c.id, AgentType::Patient, 0)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn privileged_history_sees_every_agent() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        f.manager
            .record_turn(c.id, AgentType::Patient, SenderRole::User, "patient", None)
            .await
            .unwrap();
        f.store
            .append(NewMessage::new(c.id, AgentType::Clinical, SenderRole::User, "clinical"))
            .await
            .unwrap();

        let audit = HistoryAudit::new("ops@clinic", "incident review");
        let all = f
            .manager
            .get_unscoped_history_privileged(c.id, 10, &audit)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "clinical");
    }

    #[tokio::test]
    async fn privileged_history_is_audited_per_read() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        let events = CapturedEvents::default();
        let _guard = events.install();

        let audit = HistoryAudit::new("ops@clinic", "incident review");
        for _ in 0..2 {
            f.manager
                .get_unscoped_history_privileged(c.id, 10, &audit)
                .await
                .unwrap();
        }

        let audited = events.for_target("audit");
        assert_eq!(audited.len(), 2);
        for event in &audited {
            assert_eq!(event.fields["actor"], "ops@clinic");
            assert_eq!(event.fields["reason"], "incident review");
            assert_eq!(event.fields["conversation_id"], c.id.to_string());
        }
    }

    #[tokio::test]
    async fn scoped_history_is_not_audited() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        let events = CapturedEvents::default();
        let _guard = events.install();

        f.manager
            .get_scoped_history(c.id, AgentType::Patient, 10)
            .await
            .unwrap();

        assert!(events.for_target("audit").is_empty());
    }

    #[tokio::test]
    async fn stages_only_move_forward() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        let booked = f
            .manager
            .advance_stage(c.id, Stage::Booking, json!({"name": "Ada"}))
            .await
            .unwrap();
        assert_eq!(booked.stage, Stage::Booking);
        assert_eq!(booked.state, json!({"name": "Ada"}));

        let err = kind(
            f.manager
                .advance_stage(c.id, Stage::Greeting, json!({}))
                .await,
        );
        assert_eq!(
            err,
            ConversationError::InvalidTransition {
                id: c.id,
                from: Stage::Booking,
                to: Stage::Greeting,
            }
        );

        let err = kind(
            f.manager
                .advance_stage(c.id, Stage::Booking, json!({}))
                .await,
        );
        assert!(matches!(err, ConversationError::InvalidTransition { .. }));

        let stored = f.store.load_conversation(c.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Booking);
        assert_eq!(stored.state, json!({"name": "Ada"}));

        let closing = f
            .manager
            .advance_stage(c.id, Stage::Closing, json!({"name": "Ada"}))
            .await
            .unwrap();
        assert_eq!(closing.stage, Stage::Closing);
    }

    #[tokio::test]
    async fn reaching_finalized_freezes_progress_but_not_the_log() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        let done = f
            .manager
            .advance_stage(c.id, Stage::Finalized, json!({"name": "Ada"}))
            .await
            .unwrap();
        assert!(done.finalized);

        let err = kind(f.manager.update_state(c.id, json!({})).await);
        assert_eq!(err, ConversationError::AlreadyFinalized { id: c.id });

        f.manager
            .record_turn(c.id, AgentType::Patient, SenderRole::Assistant, "See you!", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_state_keeps_stage() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        f.manager
            .advance_stage(c.id, Stage::Booking, json!({}))
            .await
            .unwrap();

        let updated = f
            .manager
            .update_state(c.id, json!({"phone": "555-0100"}))
            .await
            .unwrap();
        assert_eq!(updated.stage, Stage::Booking);
        assert_eq!(updated.state["phone"], "555-0100");
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn finalize_twice_matches_finalize_once() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        f.manager.finalize_conversation(c.id).await.unwrap();
        let once = f.store.load_conversation(c.id).await.unwrap().unwrap();
        f.manager.finalize_conversation(c.id).await.unwrap();
        let twice = f.store.load_conversation(c.id).await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert!(twice.finalized);

        let err = kind(
            f.manager
                .advance_stage(c.id, Stage::Closing, json!({}))
                .await,
        );
        assert_eq!(err, ConversationError::AlreadyFinalized { id: c.id });

        let leads = f.manager.list_leads(f.client).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id, c.id);
    }

    #[tokio::test]
    async fn lead_event_fires_once_across_repeated_finalize() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        let events = CapturedEvents::default();
        let _guard = events.install();

        f.manager.finalize_conversation(c.id).await.unwrap();
        f.manager.finalize_conversation(c.id).await.unwrap();

        let leads = events.for_target("leads");
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].fields["conversation_id"], c.id.to_string());
        assert_eq!(leads[0].fields["client_id"], f.client.to_string());
    }

    #[tokio::test]
    async fn advancing_to_finalized_emits_the_lead_event_once() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        let events = CapturedEvents::default();
        let _guard = events.install();

        f.manager
            .advance_stage(c.id, Stage::Booking, json!({"name": "Ada"}))
            .await
            .unwrap();
        assert!(events.for_target("leads").is_empty());

        f.manager
            .advance_stage(c.id, Stage::Finalized, json!({"name": "Ada"}))
            .await
            .unwrap();
        f.manager.finalize_conversation(c.id).await.unwrap();

        let leads = events.for_target("leads");
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].fields["collected"], r#"{"name":"Ada"}"#);
    }

    #[tokio::test]
    async fn finalize_unknown_conversation_is_not_found() {
        let f = fixture();
        let id = ConversationId::new();
        let err = kind(f.manager.finalize_conversation(id).await);
        assert_eq!(err, ConversationError::NotFound { id });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_advances_have_one_winner() {
        let f = fixture();
        let c = patient_conversation(&f).await;

        let a = {
            let manager = f.manager.clone();
            tokio::spawn(async move {
                manager
                    .advance_stage(c.id, Stage::Booking, json!({"by": "a"}))
                    .await
            })
        };
        let b = {
            let manager = f.manager.clone();
            tokio::spawn(async move {
                manager
                    .advance_stage(c.id, Stage::Booking, json!({"by": "b"}))
                    .await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            let err = result.as_ref().unwrap_err().current_context();
            assert!(matches!(
                err,
                ConversationError::InvalidTransition { .. }
                    | ConversationError::ConcurrentModification { .. }
            ));
        }

        let stored = f.store.load_conversation(c.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Booking);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn storage_outage_surfaces_as_transient() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        f.store.set_unavailable(true);

        let err = kind(
            f.manager
                .get_scoped_history(c.id, AgentType::Patient, 5)
                .await,
        );
        assert!(matches!(err, ConversationError::StorageUnavailable { .. }));
        assert!(err.is_transient());
    }

    /// Lets another writer bump the version right before the first write.
    struct Interloper {
        inner: Arc<InMemoryStore>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl ConversationStore for Interloper {
        async fn create_conversation(
            &self,
            client_id: ClientId,
            agent_type: AgentType,
            initial_stage: Stage,
        ) -> std::result::Result<Conversation, StoreError> {
            self.inner
                .create_conversation(client_id, agent_type, initial_stage)
                .await
        }

        async fn load_conversation(
            &self,
            id: ConversationId,
        ) -> std::result::Result<Option<Conversation>, StoreError> {
            self.inner.load_conversation(id).await
        }

        async fn update_stage(
            &self,
            id: ConversationId,
            expected_version: i64,
            stage: Stage,
            state: JsonValue,
        ) -> std::result::Result<Conversation, StoreError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let current = self.inner.load_conversation(id).await?.ok_or(StoreError::NotFound { id })?;
                self.inner
                    .update_stage(id, current.version, current.stage, json!({"interloper": true}))
                    .await?;
            }
            self.inner
                .update_stage(id, expected_version, stage, state)
                .await
        }

        async fn finalize(&self, id: ConversationId) -> std::result::Result<FinalizeOutcome, StoreError> {
            self.inner.finalize(id).await
        }

        async fn list_finalized(
            &self,
            client_id: ClientId,
        ) -> std::result::Result<Vec<Conversation>, StoreError> {
            self.inner.list_finalized(client_id).await
        }
    }

    /// Reports a lost race on every write.
    struct AlwaysContended {
        inner: Arc<InMemoryStore>,
        writes: AtomicU32,
    }

    #[async_trait]
    impl ConversationStore for AlwaysContended {
        async fn create_conversation(
            &self,
            client_id: ClientId,
            agent_type: AgentType,
            initial_stage: Stage,
        ) -> std::result::Result<Conversation, StoreError> {
            self.inner
                .create_conversation(client_id, agent_type, initial_stage)
                .await
        }

        async fn load_conversation(
            &self,
            id: ConversationId,
        ) -> std::result::Result<Option<Conversation>, StoreError> {
            self.inner.load_conversation(id).await
        }

        async fn update_stage(
            &self,
            id: ConversationId,
            expected_version: i64,
            _stage: Stage,
            _state: JsonValue,
        ) -> std::result::Result<Conversation, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::ConcurrentModification {
                id,
                expected_version,
            })
        }

        async fn finalize(&self, id: ConversationId) -> std::result::Result<FinalizeOutcome, StoreError> {
            self.inner.finalize(id).await
        }

        async fn list_finalized(
            &self,
            client_id: ClientId,
        ) -> std::result::Result<Vec<Conversation>, StoreError> {
            self.inner.list_finalized(client_id).await
        }
    }

    #[tokio::test]
    async fn lost_race_is_retried_against_fresh_state() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        let contended = Arc::new(Interloper {
            inner: f.store.clone(),
            fired: AtomicBool::new(false),
        });
        let manager = StateManager::new(
            contended,
            f.store.clone(),
            f.store.clone(),
            ManagerConfig::default(),
        );

        let updated = manager
            .advance_stage(c.id, Stage::Booking, json!({"name": "Ada"}))
            .await
            .unwrap();

        assert_eq!(updated.stage, Stage::Booking);
        assert_eq!(updated.state, json!({"name": "Ada"}));
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let f = fixture();
        let c = patient_conversation(&f).await;
        let contended = Arc::new(AlwaysContended {
            inner: f.store.clone(),
            writes: AtomicU32::new(0),
        });
        let manager = StateManager::new(
            contended.clone(),
            f.store.clone(),
            f.store.clone(),
            ManagerConfig {
                max_update_attempts: 3,
                ..ManagerConfig::default()
            },
        );

        let err = kind(
            manager
                .advance_stage(c.id, Stage::Booking, json!({}))
                .await,
        );
        assert_eq!(
            err,
            ConversationError::ConcurrentModification {
                id: c.id,
                attempts: 3
            }
        );
        assert_eq!(contended.writes.load(Ordering::SeqCst), 3);

        let stored = f.store.load_conversation(c.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Greeting);
    }
}
