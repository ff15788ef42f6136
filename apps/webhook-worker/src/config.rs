//! Worker configuration loaded from environment variables.
//!
//! Required:
//! - `DATABASE_URL`: PostgreSQL connection string
//!
//! Optional:
//! - `DATABASE_MAX_CONNECTIONS` (10)
//! - `LOG_FILTER` (info)
//! - every `WEBHOOK_*` variable read by [`WebhookConfig::from_env`]

use crm_webhooks::{ConfigError as WebhookConfigError, WebhookConfig};
use std::env;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error(transparent)]
    Webhook(#[from] WebhookConfigError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub log_filter: String,
    pub webhooks: WebhookConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) if !raw.trim().is_empty() => match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "DATABASE_MAX_CONNECTIONS".to_string(),
                        message: format!("expected a positive integer, got {raw:?}"),
                    })
                }
            },
            _ => DEFAULT_MAX_CONNECTIONS,
        };

        let log_filter = lookup("LOG_FILTER")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let webhooks = WebhookConfig::from_lookup(&lookup)?;

        Ok(Self {
            database_url,
            max_connections,
            log_filter,
            webhooks,
        })
    }
}
