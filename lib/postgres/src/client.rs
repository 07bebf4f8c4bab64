//! Client (tenant) repository.

use crate::error::{classify, corrupt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_concierge_conversation::{Client, ClientDirectory, StoreError};
use clinic_concierge_core::ClientId;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

#[derive(FromRow)]
struct ClientRow {
    id: String,
    clinic_name: String,
    lead_webhook_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl ClientRow {
    fn try_into_client(self) -> Result<Client, StoreError> {
        let id = ClientId::from_str(&self.id).map_err(|e| corrupt("client id", &self.id, e))?;
        Ok(Client {
            id,
            clinic_name: self.clinic_name,
            lead_webhook_url: self.lead_webhook_url,
            created_at: self.created_at,
        })
    }
}

/// Repository for tenants.
#[derive(Clone)]
pub struct ClientRepository {
    pool: PgPool,
}

impl ClientRepository {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClientDirectory for ClientRepository {
    async fn load_client(&self, id: ClientId) -> Result<Option<Client>, StoreError> {
        let row: Option<ClientRow> = sqlx::query_as(
            "SELECT id, clinic_name, lead_webhook_url, created_at FROM clients WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(ClientRow::try_into_client).transpose()
    }
}
