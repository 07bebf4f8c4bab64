//! Chat message repository.
//!
//! Messages are append-only. Every query filters on the stamped agent type
//! of each row, so a scoped read can never return another agent's turns.

use crate::error::{classify, corrupt, is_foreign_key_violation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_concierge_conversation::{
    AgentType, HistoryFilter, Message, MessageLog, NewMessage, SenderRole, StoreError,
};
use clinic_concierge_core::{ConversationId, MessageSeq};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::instrument;

/// Row type for message queries.
#[derive(FromRow)]
struct MessageRow {
    seq: i64,
    conversation_id: String,
    agent_type: String,
    sender: String,
    content: String,
    created_at: DateTime<Utc>,
    latency_ms: Option<i32>,
}

impl MessageRow {
    fn try_into_message(self) -> Result<Message, StoreError> {
        let conversation_id = ConversationId::from_str(&self.conversation_id)
            .map_err(|e| corrupt("conversation id", &self.conversation_id, e))?;
        let agent_type = AgentType::from_str(&self.agent_type)
            .map_err(|e| corrupt("agent type", &self.agent_type, e))?;
        let sender =
            SenderRole::from_str(&self.sender).map_err(|e| corrupt("sender", &self.sender, e))?;

        Ok(Message {
            seq: MessageSeq::new(self.seq),
            conversation_id,
            agent_type,
            sender,
            content: self.content,
            created_at: self.created_at,
            latency_ms: self.latency_ms,
        })
    }
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
    rows.into_iter().map(MessageRow::try_into_message).collect()
}

/// Repository for chat messages.
#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLog for MessageRepository {
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, agent_type = %message.agent_type))]
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let conversation_id = message.conversation_id;

        // The activity touch and the insert share one statement so a message
        // is never stored without its conversation's activity moving.
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            WITH touched AS (
                UPDATE conversations
                SET last_activity_at = NOW()
                WHERE id = $1
                RETURNING id
            )
            INSERT INTO chat_messages (conversation_id, agent_type, sender, content, latency_ms)
            SELECT id, $2, $3, $4, $5 FROM touched
            RETURNING seq, conversation_id, agent_type, sender, content, created_at, latency_ms
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(message.agent_type.as_str())
        .bind(message.sender.as_str())
        .bind(&message.content)
        .bind(message.latency_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::UnknownConversation {
                    id: conversation_id,
                }
            } else {
                classify(e)
            }
        })?;

        row.ok_or(StoreError::UnknownConversation {
            id: conversation_id,
        })?
        .try_into_message()
    }

    async fn query_scoped(
        &self,
        filter: &HistoryFilter,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT seq, conversation_id, agent_type, sender, content, created_at, latency_ms
            FROM chat_messages
            WHERE conversation_id = $1 AND agent_type = $2
            ORDER BY created_at DESC, seq DESC
            LIMIT $3
            "#,
        )
        .bind(filter.conversation_id().to_string())
        .bind(filter.agent_type().as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        into_messages(rows)
    }

    async fn query_unscoped(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT seq, conversation_id, agent_type, sender, content, created_at, latency_ms
            FROM chat_messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        into_messages(rows)
    }
}
