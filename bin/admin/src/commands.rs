//! Command definitions and dispatch for `concierge-admin`.

use clap::{Parser, Subcommand};
use clinic_concierge_conversation::{AgentType, ConversationError, HistoryAudit, StateManager};
use clinic_concierge_core::{ClientId, ConversationId, Result};
use serde_json::{Value as JsonValue, json};

/// Operator tooling for the conversation store.
#[derive(Debug, Parser)]
#[command(name = "concierge-admin", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending schema migrations.
    Migrate,

    #[command(flatten)]
    Read(ReadCommand),
}

/// Commands served by the state manager.
#[derive(Debug, Subcommand)]
pub enum ReadCommand {
    /// List a clinic's finalized conversations, newest first.
    Leads {
        /// Clinic to list leads for.
        #[arg(long)]
        client: ClientId,
    },

    /// Show the history one agent is allowed to see.
    History {
        #[arg(long)]
        conversation: ConversationId,

        /// Agent whose view to show (`patient` or `clinical`).
        #[arg(long)]
        agent: AgentType,

        /// Maximum number of messages, most recent first.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show every message of a conversation regardless of agent. Audited.
    AuditHistory {
        #[arg(long)]
        conversation: ConversationId,

        /// Operator performing the read.
        #[arg(long)]
        actor: String,

        /// Why the unscoped read is needed.
        #[arg(long)]
        reason: String,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

/// Runs a read command against the manager and renders its result as JSON.
pub async fn run(
    manager: &StateManager,
    command: ReadCommand,
) -> Result<JsonValue, ConversationError> {
    let output = match command {
        ReadCommand::Leads { client } => {
            let leads = manager.list_leads(client).await?;
            json!({"client_id": client, "count": leads.len(), "leads": leads})
        }
        ReadCommand::History {
            conversation,
            agent,
            limit,
        } => {
            let messages = match limit {
                Some(limit) => {
                    manager
                        .get_scoped_history(conversation, agent, limit)
                        .await?
                }
                None => manager.get_recent_history(conversation, agent).await?,
            };
            json!({"conversation_id": conversation, "agent_type": agent, "messages": messages})
        }
        ReadCommand::AuditHistory {
            conversation,
            actor,
            reason,
            limit,
        } => {
            let audit = HistoryAudit::new(actor, reason);
            let messages = manager
                .get_unscoped_history_privileged(conversation, limit, &audit)
                .await?;
            json!({"conversation_id": conversation, "audit": audit, "messages": messages})
        }
    };
    Ok(output)
}
