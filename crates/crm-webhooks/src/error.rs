//! Error types for the webhook engine.

use thiserror::Error;

/// Webhook engine error variants.
///
/// These are returned by store operations and construction helpers. Delivery
/// attempt failures are not errors: they are captured as
/// [`DeliveryFailure`](crate::executor::DeliveryFailure) values inside a
/// [`DeliveryOutcome`](crate::executor::DeliveryOutcome) and persisted.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("SSRF protection: {0}")]
    SsrfDetected(String),

    #[error("Subscriber not found")]
    SubscriberNotFound,

    #[error("Delivery not found")]
    DeliveryNotFound,

    #[error("Invalid stored value: {0}")]
    InvalidData(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type WebhookResult<T> = Result<T, WebhookError>;
