//! Connection pool bootstrap and schema migrations.

use clinic_concierge_conversation::StoreError;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::fmt::Display;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pool and connection bootstrap settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Upper bound on pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Extra connection attempts made when the database is not yet reachable.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Pause between connection attempts, in milliseconds.
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    /// How long a caller waits for a pooled connection, in seconds.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_retries() -> u32 {
    5
}

fn default_connect_retry_delay_ms() -> u64 {
    2000
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

/// Runs `op` until it succeeds or `retries` extra attempts are used up.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// when every attempt fails.
pub async fn retry_with_delay<T, E, F, Fut>(
    retries: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(attempts, error = %e, "giving up after final attempt");
                return Err(e);
            }
        }
    }
}

/// Opens a connection pool, waiting for the database to come up.
pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

    let pool = retry_with_delay(
        config.connect_retries,
        Duration::from_millis(config.connect_retry_delay_ms),
        |_| options.clone().connect(database_url),
    )
    .await
    .map_err(|e| StoreError::Unavailable {
        reason: e.to_string(),
    })?;

    info!(max_connections = config.max_connections, "database pool ready");
    Ok(pool)
}

/// Applies the embedded schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable {
            reason: format!("migration failed: {e}"),
        })?;
    info!("database migrations applied");
    Ok(())
}
