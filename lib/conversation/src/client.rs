//! Tenant records.

use chrono::{DateTime, Utc};
use clinic_concierge_core::ClientId;
use serde::{Deserialize, Serialize};

/// A tenant (clinic).
///
/// Provisioned outside the state manager; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Unique client identifier.
    pub id: ClientId,
    /// Clinic display name.
    pub clinic_name: String,
    /// Where finalized leads are delivered, if configured.
    pub lead_webhook_url: Option<String>,
    /// When the client was provisioned.
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// Creates a client record with no webhook configured.
    #[must_use]
    pub fn new(clinic_name: impl Into<String>) -> Self {
        Self {
            id: ClientId::new(),
            clinic_name: clinic_name.into(),
            lead_webhook_url: None,
            created_at: Utc::now(),
        }
    }
}
