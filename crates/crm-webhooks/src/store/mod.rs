//! Persistence for subscribers, delivery records and the attempt log.
//!
//! All coordination state lives behind [`DeliveryStore`], which keeps the
//! dispatcher and retry scheduler stateless and lets several workers share
//! one database.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::WebhookResult;
use crate::health::SubscriberHealth;
use crate::models::{
    AttemptResult, DeliveryAttempt, DeliveryRecord, NewDelivery, Subscriber, WebhookEventType,
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// A delivery record claimed for retry together with its owning subscriber.
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    pub record: DeliveryRecord,
    pub subscriber: Subscriber,
}

/// Storage backend for the delivery engine.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert or replace a subscriber. Used by subscription management and tests.
    async fn upsert_subscriber(&self, subscriber: Subscriber) -> WebhookResult<()>;

    async fn get_subscriber(&self, id: Uuid) -> WebhookResult<Option<Subscriber>>;

    /// Active, unpaused subscribers whose event set contains `event`.
    async fn eligible_subscribers(&self, event: WebhookEventType) -> WebhookResult<Vec<Subscriber>>;

    /// Reset the failure counter and stamp `last_success_at`.
    async fn record_subscriber_success(&self, id: Uuid, at: DateTime<Utc>) -> WebhookResult<()>;

    /// Atomically increment the failure counter, pausing at `threshold`.
    async fn record_subscriber_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: u32,
    ) -> WebhookResult<SubscriberHealth>;

    /// Clear the pause flag and the failure counter.
    async fn resume_subscriber(&self, id: Uuid) -> WebhookResult<()>;

    /// Insert a new pending record.
    async fn create_delivery(&self, new: NewDelivery) -> WebhookResult<DeliveryRecord>;

    async fn get_delivery(&self, id: Uuid) -> WebhookResult<Option<DeliveryRecord>>;

    /// Most recent records of one subscriber, newest first.
    async fn list_deliveries(
        &self,
        subscriber_id: Uuid,
        limit: usize,
    ) -> WebhookResult<Vec<DeliveryRecord>>;

    /// Write the result of an attempt and release any claim.
    async fn complete_attempt(&self, id: Uuid, result: AttemptResult)
        -> WebhookResult<DeliveryRecord>;

    /// Close a record permanently: `failed` with no next retry.
    async fn mark_exhausted(&self, id: Uuid) -> WebhookResult<DeliveryRecord>;

    /// Atomically claim up to `limit` records due for retry at `now`.
    ///
    /// Only records whose subscriber is active and unpaused are considered;
    /// everything else is left untouched. Claimed records move to
    /// `in_flight`. Records stuck in flight for longer than `lease` are
    /// claimable again.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> WebhookResult<Vec<ClaimedDelivery>>;

    /// Append one entry to the attempt log.
    async fn append_attempt(&self, attempt: DeliveryAttempt) -> WebhookResult<()>;

    /// Attempt log of a delivery, oldest first.
    async fn list_attempts(&self, delivery_id: Uuid) -> WebhookResult<Vec<DeliveryAttempt>>;
}
