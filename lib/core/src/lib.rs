//! Core domain types and utilities for clinic-concierge.
//!
//! This crate provides the identifier types and the error handling
//! foundation shared by the conversation state manager and its storage
//! adapters.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ClientId, ConversationId, MessageSeq, ParseIdError};
