//! State manager configuration.

use serde::Deserialize;

/// Tunables for [`StateManager`](crate::StateManager).
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// How many times a stage or state write is attempted when it keeps
    /// losing to concurrent writers. Values below one are treated as one.
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,

    /// History length used when a caller does not ask for a specific one.
    #[serde(default = "default_history_limit")]
    pub default_history_limit: u32,
}

fn default_max_update_attempts() -> u32 {
    3
}

fn default_history_limit() -> u32 {
    10
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: default_max_update_attempts(),
            default_history_limit: default_history_limit(),
        }
    }
}
