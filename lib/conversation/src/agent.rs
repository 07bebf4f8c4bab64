//! Agent types.
//!
//! Every conversation and every log entry is owned by exactly one agent.
//! The agent type is the unit of history isolation: a history read made on
//! behalf of one agent never observes entries tagged with another.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::fmt;
use std::str::FromStr;

/// The conversational assistant that owns a conversation or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Patient-facing appointment booking assistant.
    Patient,
    /// Clinician-facing advisor.
    Clinical,
}

impl AgentType {
    /// All agent types, in a stable order.
    pub const ALL: [AgentType; 2] = [AgentType::Patient, AgentType::Clinical];

    /// Returns the persisted tag for this agent type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Clinical => "clinical",
        }
    }

    /// State blob a freshly created conversation starts with.
    ///
    /// Patient conversations carry the booking slots the assistant fills in;
    /// clinical conversations start empty.
    #[must_use]
    pub fn initial_state(&self) -> JsonValue {
        match self {
            Self::Patient => json!({
                "name": null,
                "phone": null,
                "email": null,
                "service": null,
                "appointment_type": null,
                "last_visit": null,
                "preferred_date": null,
                "preferred_time": null,
            }),
            Self::Clinical => JsonValue::Object(Map::new()),
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an agent tag outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAgentTypeError {
    /// The rejected tag.
    pub value: String,
}

impl fmt::Display for ParseAgentTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent type '{}'", self.value)
    }
}

impl std::error::Error for ParseAgentTypeError {}

impl FromStr for AgentType {
    type Err = ParseAgentTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Self::Patient),
            "clinical" => Ok(Self::Clinical),
            other => Err(ParseAgentTypeError {
                value: other.to_string(),
            }),
        }
    }
}
