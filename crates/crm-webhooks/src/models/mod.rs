//! Domain types: event catalog, subscribers, delivery records, envelope.

mod delivery;
mod envelope;
mod event_type;
mod subscriber;

pub use delivery::{
    AttemptResult, DeliveryAttempt, DeliveryRecord, DeliveryState, DeliveryStatus, NewDelivery,
};
pub use envelope::Envelope;
pub use event_type::{WebhookEventType, EVENT_CATALOG_VERSION};
pub use subscriber::{Subscriber, DEFAULT_BASE_RETRY_DELAY_SECS, DEFAULT_MAX_RETRIES};
