mod commands;
mod config;

use clap::Parser;
use clinic_concierge_conversation::StateManager;
use clinic_concierge_postgres::{ClientRepository, ConversationRepository, MessageRepository};
use commands::{Cli, Command};
use config::{AdminConfig, LogFormat};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only command output.
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration from environment
    let config = AdminConfig::from_env().expect("failed to load configuration");
    init_tracing(config.log.format);

    let pool = clinic_concierge_postgres::connect(&config.database_url, &config.database)
        .await
        .expect("failed to connect to database");

    let read = match cli.command {
        Command::Migrate => {
            return match clinic_concierge_postgres::migrate(&pool).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "migration failed");
                    ExitCode::FAILURE
                }
            };
        }
        Command::Read(read) => read,
    };

    let manager = StateManager::new(
        Arc::new(ConversationRepository::new(pool.clone())),
        Arc::new(MessageRepository::new(pool.clone())),
        Arc::new(ClientRepository::new(pool)),
        config.manager,
    );

    match commands::run(&manager, read).await {
        Ok(output) => {
            println!("{output:#}");
            ExitCode::SUCCESS
        }
        Err(report) => {
            let error = report.current_context();
            tracing::error!(error = %error, transient = error.is_transient(), "command failed");
            ExitCode::FAILURE
        }
    }
}
