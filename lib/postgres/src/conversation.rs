//! Conversation repository.

use crate::error::{classify, corrupt, is_foreign_key_violation, is_unique_violation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_concierge_conversation::{
    AgentType, Conversation, ConversationStore, FinalizeOutcome, Stage, StoreError,
};
use clinic_concierge_core::{ClientId, ConversationId};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::{debug, instrument};

const CONVERSATION_COLUMNS: &str = "id, client_id, agent_type, stage, state, version, finalized, \
     finalized_at, created_at, last_activity_at";

/// Row type for conversation queries.
#[derive(FromRow)]
struct ConversationRow {
    id: String,
    client_id: String,
    agent_type: String,
    stage: String,
    state: JsonValue,
    version: i64,
    finalized: bool,
    finalized_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl ConversationRow {
    fn try_into_conversation(self) -> Result<Conversation, StoreError> {
        let id = ConversationId::from_str(&self.id)
            .map_err(|e| corrupt("conversation id", &self.id, e))?;
        let client_id =
            ClientId::from_str(&self.client_id).map_err(|e| corrupt("client id", &self.client_id, e))?;
        let agent_type = AgentType::from_str(&self.agent_type)
            .map_err(|e| corrupt("agent type", &self.agent_type, e))?;
        let stage = Stage::from_str(&self.stage).map_err(|e| corrupt("stage", &self.stage, e))?;

        Ok(Conversation {
            id,
            client_id,
            agent_type,
            stage,
            state: self.state,
            version: self.version,
            finalized: self.finalized,
            finalized_at: self.finalized_at,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        })
    }
}

/// Repository for conversation records.
#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

impl ConversationRepository {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(ConversationRow::try_into_conversation).transpose()
    }
}

#[async_trait]
impl ConversationStore for ConversationRepository {
    #[instrument(skip(self), fields(client_id = %client_id, agent_type = %agent_type))]
    async fn create_conversation(
        &self,
        client_id: ClientId,
        agent_type: AgentType,
        initial_stage: Stage,
    ) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(client_id, agent_type, initial_stage);

        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, client_id, agent_type, stage, state, version, finalized,
                 finalized_at, created_at, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.client_id.to_string())
        .bind(conversation.agent_type.as_str())
        .bind(conversation.stage.as_str())
        .bind(&conversation.state)
        .bind(conversation.version)
        .bind(conversation.finalized)
        .bind(conversation.finalized_at)
        .bind(conversation.created_at)
        .bind(conversation.last_activity_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate {
                    id: conversation.id,
                }
            } else if is_foreign_key_violation(&e) {
                StoreError::UnknownClient { id: client_id }
            } else {
                classify(e)
            }
        })?;

        debug!(conversation_id = %conversation.id, "inserted conversation");
        Ok(conversation)
    }

    async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self, state), fields(conversation_id = %id, stage = %stage))]
    async fn update_stage(
        &self,
        id: ConversationId,
        expected_version: i64,
        stage: Stage,
        state: JsonValue,
    ) -> Result<Conversation, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE conversations
            SET stage = $3,
                state = $4,
                version = version + 1,
                last_activity_at = NOW(),
                finalized = finalized OR $5,
                finalized_at = CASE WHEN $5 THEN NOW() ELSE finalized_at END
            WHERE id = $1
              AND version = $2
              AND NOT finalized
              AND stage <> 'FINALIZED'
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(expected_version)
        .bind(stage.as_str())
        .bind(&state)
        .bind(stage.is_terminal())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        if let Some(row) = row {
            return row.try_into_conversation();
        }

        // Nothing matched; work out which guard rejected the write.
        match self.fetch(id).await? {
            None => Err(StoreError::NotFound { id }),
            Some(current) if !current.accepts_progress() => {
                Err(StoreError::AlreadyFinalized { id })
            }
            Some(_) => Err(StoreError::ConcurrentModification {
                id,
                expected_version,
            }),
        }
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    async fn finalize(&self, id: ConversationId) -> Result<FinalizeOutcome, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE conversations
            SET finalized = TRUE,
                finalized_at = NOW(),
                last_activity_at = NOW(),
                version = version + 1
            WHERE id = $1 AND NOT finalized
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        match row {
            Some(row) => Ok(FinalizeOutcome::Finalized(row.try_into_conversation()?)),
            None => self
                .fetch(id)
                .await?
                .map(FinalizeOutcome::AlreadyFinalized)
                .ok_or(StoreError::NotFound { id }),
        }
    }

    async fn list_finalized(&self, client_id: ClientId) -> Result<Vec<Conversation>, StoreError> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE client_id = $1 AND finalized
            ORDER BY finalized_at DESC
            "#
        ))
        .bind(client_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter()
            .map(ConversationRow::try_into_conversation)
            .collect()
    }
}
