//! PostgreSQL persistence for the conversation state manager.
//!
//! This crate provides repositories implementing the persistence ports of
//! `clinic-concierge-conversation`:
//! - Conversations (`ConversationRepository`)
//! - The append-only message log (`MessageRepository`)
//! - Tenants (`ClientRepository`)
//!
//! plus pool bootstrap and the embedded schema migrations.

pub mod client;
pub mod conversation;
mod error;
pub mod message;
pub mod pool;

pub use client::ClientRepository;
pub use conversation::ConversationRepository;
pub use message::MessageRepository;
pub use pool::{DatabaseConfig, connect, migrate, retry_with_delay};
