//! In-process store. Suitable for tests and single-node embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ClaimedDelivery, DeliveryStore};
use crate::error::{WebhookError, WebhookResult};
use crate::health::SubscriberHealth;
use crate::models::{
    AttemptResult, DeliveryAttempt, DeliveryRecord, DeliveryStatus, NewDelivery, Subscriber,
    WebhookEventType,
};

/// [`DeliveryStore`] kept in memory behind async locks.
///
/// Locks are always taken in the order subscribers → deliveries → attempts.
#[derive(Default)]
pub struct InMemoryStore {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    deliveries: RwLock<HashMap<Uuid, DeliveryRecord>>,
    attempts: RwLock<HashMap<Uuid, Vec<DeliveryAttempt>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, oldest first.
    pub async fn all_deliveries(&self) -> Vec<DeliveryRecord> {
        let mut records: Vec<_> = self.deliveries.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    async fn update_health<F>(&self, id: Uuid, f: F) -> WebhookResult<SubscriberHealth>
    where
        F: FnOnce(&mut SubscriberHealth) + Send,
    {
        let mut subscribers = self.subscribers.write().await;
        let sub = subscribers
            .get_mut(&id)
            .ok_or(WebhookError::SubscriberNotFound)?;
        f(&mut sub.health);
        Ok(sub.health.clone())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn upsert_subscriber(&self, subscriber: Subscriber) -> WebhookResult<()> {
        self.subscribers
            .write()
            .await
            .insert(subscriber.id, subscriber);
        Ok(())
    }

    async fn get_subscriber(&self, id: Uuid) -> WebhookResult<Option<Subscriber>> {
        Ok(self.subscribers.read().await.get(&id).cloned())
    }

    async fn eligible_subscribers(
        &self,
        event: WebhookEventType,
    ) -> WebhookResult<Vec<Subscriber>> {
        let subscribers = self.subscribers.read().await;
        let mut eligible: Vec<_> = subscribers
            .values()
            .filter(|s| s.is_eligible_for(event))
            .cloned()
            .collect();
        eligible.sort_by_key(|s| s.id);
        Ok(eligible)
    }

    async fn record_subscriber_success(&self, id: Uuid, at: DateTime<Utc>) -> WebhookResult<()> {
        self.update_health(id, |h| h.record_success(at)).await?;
        Ok(())
    }

    async fn record_subscriber_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: u32,
    ) -> WebhookResult<SubscriberHealth> {
        self.update_health(id, |h| {
            h.record_failure(at, threshold);
        })
        .await
    }

    async fn resume_subscriber(&self, id: Uuid) -> WebhookResult<()> {
        self.update_health(id, SubscriberHealth::resume).await?;
        Ok(())
    }

    async fn create_delivery(&self, new: NewDelivery) -> WebhookResult<DeliveryRecord> {
        let record = DeliveryRecord::pending(new);
        let mut deliveries = self.deliveries.write().await;
        if deliveries.contains_key(&record.id) {
            return Err(WebhookError::Internal(format!(
                "Delivery {} already exists",
                record.id
            )));
        }
        deliveries.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_delivery(&self, id: Uuid) -> WebhookResult<Option<DeliveryRecord>> {
        Ok(self.deliveries.read().await.get(&id).cloned())
    }

    async fn list_deliveries(
        &self,
        subscriber_id: Uuid,
        limit: usize,
    ) -> WebhookResult<Vec<DeliveryRecord>> {
        let deliveries = self.deliveries.read().await;
        let mut records: Vec<_> = deliveries
            .values()
            .filter(|r| r.subscriber_id == subscriber_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        result: AttemptResult,
    ) -> WebhookResult<DeliveryRecord> {
        let mut deliveries = self.deliveries.write().await;
        let record = deliveries
            .get_mut(&id)
            .ok_or(WebhookError::DeliveryNotFound)?;
        record.apply(&result);
        Ok(record.clone())
    }

    async fn mark_exhausted(&self, id: Uuid) -> WebhookResult<DeliveryRecord> {
        let mut deliveries = self.deliveries.write().await;
        let record = deliveries
            .get_mut(&id)
            .ok_or(WebhookError::DeliveryNotFound)?;
        record.exhaust();
        Ok(record.clone())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> WebhookResult<Vec<ClaimedDelivery>> {
        let subscribers = self.subscribers.read().await;
        let mut deliveries = self.deliveries.write().await;

        let mut due: Vec<&mut DeliveryRecord> = deliveries
            .values_mut()
            .filter(|r| r.is_claimable(now, lease))
            .filter(|r| {
                subscribers
                    .get(&r.subscriber_id)
                    .is_some_and(Subscriber::is_deliverable)
            })
            .collect();
        // Same order as Postgres: records without a retry time come last.
        due.sort_by_key(|r| (r.next_retry_at.is_none(), r.next_retry_at, r.created_at));

        let mut claimed = Vec::with_capacity(limit.min(due.len()));
        for record in due.into_iter().take(limit) {
            record.status = DeliveryStatus::InFlight;
            record.claimed_at = Some(now);
            if let Some(subscriber) = subscribers.get(&record.subscriber_id) {
                claimed.push(ClaimedDelivery {
                    record: record.clone(),
                    subscriber: subscriber.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn append_attempt(&self, attempt: DeliveryAttempt) -> WebhookResult<()> {
        self.attempts
            .write()
            .await
            .entry(attempt.delivery_id)
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn list_attempts(&self, delivery_id: Uuid) -> WebhookResult<Vec<DeliveryAttempt>> {
        let mut attempts = self
            .attempts
            .read()
            .await
            .get(&delivery_id)
            .cloned()
            .unwrap_or_default();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }
}
