//! Conversation state manager for clinic-concierge.
//!
//! This crate provides:
//!
//! - **Persistence ports**: [`ConversationStore`], [`MessageLog`] and
//!   [`ClientDirectory`], implemented by storage adapters
//! - **Isolation filter**: [`HistoryFilter`], the only way to ask the log
//!   for agent-visible history
//! - **Stage machine**: the forward-only booking [`Stage`] progression
//! - **State manager**: [`StateManager`], the orchestrator request handlers
//!   call into
//!
//! An in-memory implementation of the ports lives in [`memory`].

pub mod agent;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod filter;
pub mod manager;
pub mod memory;
pub mod message;
pub mod stage;
pub mod store;

pub use agent::{AgentType, ParseAgentTypeError};
pub use client::Client;
pub use config::ManagerConfig;
pub use conversation::Conversation;
pub use error::{ConversationError, StoreError};
pub use filter::{HistoryAudit, HistoryFilter};
pub use manager::StateManager;
pub use message::{Message, NewMessage, SenderRole};
pub use stage::{ParseStageError, Stage};
pub use store::{ClientDirectory, ConversationStore, FinalizeOutcome, MessageLog};
