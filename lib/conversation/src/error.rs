//! Error types for the conversation crate.
//!
//! Errors are layered:
//! - `StoreError`: what a persistence port reports
//! - `ConversationError`: what the state manager surfaces to its callers,
//!   wrapped in a rootcause `Report`

use crate::agent::AgentType;
use crate::stage::Stage;
use clinic_concierge_core::{ClientId, ConversationId};
use std::fmt;

/// Errors reported by persistence port implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No conversation with this id.
    NotFound { id: ConversationId },
    /// A message was appended to a conversation that does not exist.
    UnknownConversation { id: ConversationId },
    /// A conversation was created for a client that does not exist.
    UnknownClient { id: ClientId },
    /// A conversation with this id already exists.
    Duplicate { id: ConversationId },
    /// The conversation no longer accepts stage or state writes.
    AlreadyFinalized { id: ConversationId },
    /// The conversation changed since it was read.
    ConcurrentModification {
        id: ConversationId,
        expected_version: i64,
    },
    /// The backing store could not be reached.
    Unavailable { reason: String },
    /// A persisted row could not be decoded.
    Corrupt { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "conversation not found: {id}"),
            Self::UnknownConversation { id } => {
                write!(f, "cannot append to unknown conversation {id}")
            }
            Self::UnknownClient { id } => write!(f, "unknown client: {id}"),
            Self::Duplicate { id } => write!(f, "conversation already exists: {id}"),
            Self::AlreadyFinalized { id } => write!(f, "conversation {id} is finalized"),
            Self::ConcurrentModification {
                id,
                expected_version,
            } => write!(
                f,
                "conversation {id} was modified concurrently (expected version {expected_version})"
            ),
            Self::Unavailable { reason } => write!(f, "storage unavailable: {reason}"),
            Self::Corrupt { reason } => write!(f, "corrupt record: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by the state manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    /// No conversation with this id.
    NotFound { id: ConversationId },
    /// The conversation is owned by a different agent than the caller.
    AgentTypeMismatch {
        id: ConversationId,
        expected: AgentType,
        actual: AgentType,
    },
    /// The conversation is owned by a different tenant than the caller.
    ClientMismatch {
        id: ConversationId,
        expected: ClientId,
        actual: ClientId,
    },
    /// The tenant does not exist.
    UnknownClient { id: ClientId },
    /// The conversation no longer accepts stage or state writes.
    AlreadyFinalized { id: ConversationId },
    /// The requested stage is not reachable from the current one.
    InvalidTransition {
        id: ConversationId,
        from: Stage,
        to: Stage,
    },
    /// Concurrent writers kept winning until the retry budget ran out.
    ConcurrentModification { id: ConversationId, attempts: u32 },
    /// A new conversation collided with an existing id.
    DuplicateConversation { id: ConversationId },
    /// A message referenced a conversation that does not exist.
    UnknownConversation { id: ConversationId },
    /// The backing store could not be reached.
    StorageUnavailable { reason: String },
    /// A persisted row could not be decoded.
    CorruptRecord { reason: String },
}

impl ConversationError {
    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::ConcurrentModification { .. }
        )
    }
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "conversation not found: {id}"),
            Self::AgentTypeMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "conversation {id} belongs to agent '{actual}', not '{expected}'"
            ),
            Self::ClientMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "conversation {id} belongs to client {actual}, not {expected}"
            ),
            Self::UnknownClient { id } => write!(f, "unknown client: {id}"),
            Self::AlreadyFinalized { id } => write!(f, "conversation {id} is finalized"),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "invalid stage transition for {id}: {from} -> {to}")
            }
            Self::ConcurrentModification { id, attempts } => write!(
                f,
                "conversation {id} was modified concurrently ({attempts} attempts)"
            ),
            Self::DuplicateConversation { id } => {
                write!(f, "conversation already exists: {id}")
            }
            Self::UnknownConversation { id } => {
                write!(f, "cannot append to unknown conversation {id}")
            }
            Self::StorageUnavailable { reason } => write!(f, "storage unavailable: {reason}"),
            Self::CorruptRecord { reason } => write!(f, "corrupt record: {reason}"),
        }
    }
}

impl std::error::Error for ConversationError {}

impl From<StoreError> for ConversationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::UnknownConversation { id } => Self::UnknownConversation { id },
            StoreError::UnknownClient { id } => Self::UnknownClient { id },
            StoreError::Duplicate { id } => Self::DuplicateConversation { id },
            StoreError::AlreadyFinalized { id } => Self::AlreadyFinalized { id },
            StoreError::ConcurrentModification { id, .. } => {
                Self::ConcurrentModification { id, attempts: 1 }
            }
            StoreError::Unavailable { reason } => Self::StorageUnavailable { reason },
            StoreError::Corrupt { reason } => Self::CorruptRecord { reason },
        }
    }
}
