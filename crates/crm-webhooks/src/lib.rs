//! Webhook delivery engine for CRM domain events.
//!
//! Notifies external HTTP endpoints of domain events with HMAC-SHA256
//! signing, linear-backoff retries, per-subscriber circuit breaking and
//! atomic retry claims, so dispatchers and retry workers can scale out
//! against a shared Postgres store.

mod attempt;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, WebhookConfig};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use error::{WebhookError, WebhookResult};
pub use executor::{
    DeliveryExecutor, DeliveryFailure, DeliveryOutcome, DeliveryRequest, DeliveryTarget,
    HttpDeliveryExecutor,
};
pub use health::{HealthTracker, SubscriberHealth, PAUSE_THRESHOLD};
pub use models::{
    DeliveryRecord, DeliveryState, DeliveryStatus, Envelope, Subscriber, WebhookEventType,
    EVENT_CATALOG_VERSION,
};
pub use scheduler::{next_retry_at, RetryRunSummary, RetryScheduler};
pub use store::{DeliveryStore, InMemoryStore, PgStore};
pub use validation::TargetPolicy;
