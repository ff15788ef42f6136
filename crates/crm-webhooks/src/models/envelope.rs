//! The JSON body transmitted to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use super::WebhookEventType;

/// Webhook request body: `{deliveryId, event, timestamp, data}`.
///
/// `data` is the producer's payload, kept as pre-serialized JSON and never
/// reinterpreted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub delivery_id: Uuid,
    pub event: WebhookEventType,
    pub timestamp: DateTime<Utc>,
    pub data: Box<RawValue>,
}

impl Envelope {
    #[must_use]
    pub fn new(
        delivery_id: Uuid,
        event: WebhookEventType,
        timestamp: DateTime<Utc>,
        data: &RawValue,
    ) -> Self {
        Self {
            delivery_id,
            event,
            timestamp,
            data: data.to_owned(),
        }
    }

    /// Serialize to the exact bytes that are signed and sent.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse previously frozen envelope bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
