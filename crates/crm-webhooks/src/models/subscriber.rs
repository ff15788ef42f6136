//! Registered webhook endpoints.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WebhookEventType;
use crate::executor::DeliveryTarget;
use crate::health::SubscriberHealth;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay for linear retry backoff.
pub const DEFAULT_BASE_RETRY_DELAY_SECS: i64 = 60;

/// An external HTTP endpoint registered for one or more event types.
///
/// Subscribers are created and edited by subscription management; the engine
/// only reads them and mutates their [`SubscriberHealth`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub url: String,
    /// Shared HMAC secret. `None` means deliveries are sent unsigned.
    pub secret: Option<String>,
    pub events: BTreeSet<WebhookEventType>,
    /// Extra request headers. Reserved webhook headers always override these.
    pub custom_headers: BTreeMap<String, String>,
    pub active: bool,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_retry_delay: Duration,
    pub health: SubscriberHealth,
}

impl Subscriber {
    /// Create an active subscriber with default retry policy and no events.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            secret: None,
            events: BTreeSet::new(),
            custom_headers: BTreeMap::new(),
            active: true,
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: Duration::seconds(DEFAULT_BASE_RETRY_DELAY_SECS),
            health: SubscriberHealth::default(),
        }
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: impl IntoIterator<Item = WebhookEventType>) -> Self {
        self.events.extend(events);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Whether the circuit breaker has paused this subscriber.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.health.paused
    }

    /// Whether dispatch and retry may currently reach this subscriber at all.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        self.active && !self.health.paused
    }

    /// Whether a fresh `event` should be dispatched to this subscriber.
    #[must_use]
    pub fn is_eligible_for(&self, event: WebhookEventType) -> bool {
        self.is_deliverable() && self.events.contains(&event)
    }

    /// Connection details handed to the delivery executor.
    #[must_use]
    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget {
            subscriber_id: self.id,
            url: self.url.clone(),
            secret: self.secret.clone(),
            custom_headers: self.custom_headers.clone(),
        }
    }
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::seconds)
    }
}
