//! Admin CLI configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested sections (`DATABASE__MAX_CONNECTIONS`,
//! `MANAGER__MAX_UPDATE_ATTEMPTS`, `LOG__FORMAT`).

use clinic_concierge_conversation::ManagerConfig;
use clinic_concierge_postgres::DatabaseConfig;
use serde::Deserialize;

/// Configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Pool and connection bootstrap settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// State manager tunables.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Logging output settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl AdminConfig {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::default())
    }

    fn from_environment(env: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(env.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
