//! Fan-out of a domain event to every eligible subscriber.
//!
//! Each subscriber is handled independently: a pending record holding the
//! frozen envelope is created, one attempt is made, and the outcome is
//! persisted. Failures of one subscriber never affect the others and never
//! reach the caller.

use std::sync::Arc;

use serde_json::value::RawValue;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::attempt::record_attempt;
use crate::clock::{Clock, SystemClock};
use crate::config::{WebhookConfig, DEFAULT_DISPATCH_CONCURRENCY};
use crate::error::{WebhookError, WebhookResult};
use crate::executor::{DeliveryExecutor, DeliveryRequest};
use crate::health::HealthTracker;
use crate::models::{Envelope, NewDelivery, Subscriber, WebhookEventType};
use crate::store::DeliveryStore;

/// Counts for one dispatched event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Eligible subscribers found.
    pub matched: usize,
    /// First attempt succeeded.
    pub delivered: usize,
    /// First attempt failed; the record is scheduled for retry or exhausted.
    pub failed: usize,
    /// Could not be recorded at all (store error or task failure).
    pub errored: usize,
}

/// Delivers fresh events to subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DeliveryStore>,
    executor: Arc<dyn DeliveryExecutor>,
    health: HealthTracker,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DeliveryStore>, executor: Arc<dyn DeliveryExecutor>) -> Self {
        Self {
            health: HealthTracker::new(store.clone()),
            store,
            executor,
            clock: Arc::new(SystemClock),
            semaphore: Arc::new(Semaphore::new(DEFAULT_DISPATCH_CONCURRENCY)),
        }
    }

    pub fn from_config(
        store: Arc<dyn DeliveryStore>,
        executor: Arc<dyn DeliveryExecutor>,
        config: &WebhookConfig,
    ) -> Self {
        Self::new(store, executor)
            .with_concurrency(config.dispatch_concurrency)
            .with_pause_threshold(config.pause_threshold)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    #[must_use]
    pub fn with_pause_threshold(mut self, threshold: u32) -> Self {
        self.health = self.health.with_pause_threshold(threshold);
        self
    }

    /// Deliver `data` as `event` to every active, unpaused subscriber of it.
    ///
    /// Returns once every first attempt has finished and been recorded.
    pub async fn dispatch(&self, event: WebhookEventType, data: &RawValue) -> DispatchSummary {
        let subscribers = match self.store.eligible_subscribers(event).await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event = %event,
                    error = %e,
                    "Failed to query eligible subscribers"
                );
                return DispatchSummary::default();
            }
        };

        let mut summary = DispatchSummary {
            matched: subscribers.len(),
            ..DispatchSummary::default()
        };

        if subscribers.is_empty() {
            tracing::debug!(
                target: "webhook_delivery",
                event = %event,
                "No eligible subscribers for event"
            );
            return summary;
        }

        tracing::info!(
            target: "webhook_delivery",
            event = %event,
            subscriber_count = subscribers.len(),
            "Dispatching event to subscribers"
        );

        let timestamp = self.clock.now();
        let mut join_set = JoinSet::new();

        for subscriber in subscribers {
            let delivery_id = Uuid::new_v4();
            let payload = match Envelope::new(delivery_id, event, timestamp, data).to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        subscriber_id = %subscriber.id,
                        error = %e,
                        "Failed to serialize webhook envelope"
                    );
                    summary.errored += 1;
                    continue;
                }
            };

            let new = NewDelivery {
                id: delivery_id,
                subscriber_id: subscriber.id,
                event,
                payload,
                created_at: timestamp,
            };

            let this = self.clone();
            join_set.spawn(async move {
                let subscriber_id = subscriber.id;
                (subscriber_id, this.deliver_first(subscriber, new).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(true))) => summary.delivered += 1,
                Ok((_, Ok(false))) => summary.failed += 1,
                Ok((subscriber_id, Err(e))) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        event = %event,
                        subscriber_id = %subscriber_id,
                        error = %e,
                        "Failed to record delivery"
                    );
                    summary.errored += 1;
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        event = %event,
                        error = %e,
                        "Delivery task panicked"
                    );
                    summary.errored += 1;
                }
            }
        }

        summary
    }

    /// Spawn [`dispatch`](Self::dispatch) on the runtime and return immediately.
    pub fn dispatch_detached(
        &self,
        event: WebhookEventType,
        data: Box<RawValue>,
    ) -> JoinHandle<DispatchSummary> {
        let this = self.clone();
        tokio::spawn(async move { this.dispatch(event, &data).await })
    }

    /// Create the record and make the first attempt. `Ok(true)` on success.
    async fn deliver_first(&self, subscriber: Subscriber, new: NewDelivery) -> WebhookResult<bool> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| WebhookError::Internal(format!("Dispatch semaphore closed: {e}")))?;

        let record = self.store.create_delivery(new).await?;
        let request = DeliveryRequest::from_record(&record);

        let attempted_at = self.clock.now();
        let outcome = self.executor.execute(&subscriber.target(), &request).await;

        let updated = record_attempt(
            self.store.as_ref(),
            &self.health,
            &record,
            &subscriber,
            &outcome,
            0,
            attempted_at,
        )
        .await?;

        if outcome.is_success() {
            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %record.id,
                subscriber_id = %subscriber.id,
                event = %record.event,
                status_code = ?outcome.status_code,
                latency_ms = outcome.latency_ms,
                "Webhook delivered"
            );
        } else {
            tracing::warn!(
                target: "webhook_delivery",
                delivery_id = %record.id,
                subscriber_id = %subscriber.id,
                event = %record.event,
                status_code = ?outcome.status_code,
                error = ?outcome.error_message(),
                failure_kind = outcome.failure_kind().map(|k| k.as_str()),
                next_retry_at = ?updated.next_retry_at,
                "Webhook delivery failed"
            );
        }

        Ok(outcome.is_success())
    }
}
