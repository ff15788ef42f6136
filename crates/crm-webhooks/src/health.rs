//! Subscriber health tracking and the pause circuit breaker.
//!
//! Every attempt outcome feeds the owning subscriber's health: a success
//! resets the consecutive-failure counter, a failure increments it, and once
//! the counter reaches the pause threshold the subscriber is paused. A paused
//! subscriber receives neither new dispatches nor retries until an operator
//! resumes it.
//!
//! The counter is subscriber-scoped, so a successful retry of any record
//! heals it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WebhookResult;
use crate::store::DeliveryStore;

/// Consecutive failures after which a subscriber is paused.
pub const PAUSE_THRESHOLD: u32 = 10;

/// Health state persisted on each subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberHealth {
    pub consecutive_failures: u32,
    pub paused: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl SubscriberHealth {
    /// Record a successful delivery.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(at);
    }

    /// Record a failed delivery.
    ///
    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&mut self, at: DateTime<Utc>, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(at);

        if !self.paused && self.consecutive_failures >= threshold {
            self.paused = true;
            return true;
        }
        false
    }

    /// Operator action: close the circuit and start counting from zero.
    pub fn resume(&mut self) {
        self.paused = false;
        self.consecutive_failures = 0;
    }
}

/// Applies attempt outcomes to subscriber health through the store.
#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<dyn DeliveryStore>,
    pause_threshold: u32,
}

impl HealthTracker {
    #[must_use]
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store,
            pause_threshold: PAUSE_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_pause_threshold(mut self, threshold: u32) -> Self {
        self.pause_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn pause_threshold(&self) -> u32 {
        self.pause_threshold
    }

    /// Reset the failure counter after a successful attempt.
    pub async fn record_success(
        &self,
        subscriber_id: Uuid,
        at: DateTime<Utc>,
    ) -> WebhookResult<()> {
        self.store.record_subscriber_success(subscriber_id, at).await
    }

    /// Count a failed attempt, pausing the subscriber once the threshold is hit.
    pub async fn record_failure(
        &self,
        subscriber_id: Uuid,
        at: DateTime<Utc>,
    ) -> WebhookResult<SubscriberHealth> {
        let health = self
            .store
            .record_subscriber_failure(subscriber_id, at, self.pause_threshold)
            .await?;

        if health.paused && health.consecutive_failures == self.pause_threshold {
            tracing::warn!(
                target: "webhook_health",
                subscriber_id = %subscriber_id,
                consecutive_failures = health.consecutive_failures,
                threshold = self.pause_threshold,
                "Subscriber paused due to consecutive failures"
            );
        } else {
            tracing::debug!(
                target: "webhook_health",
                subscriber_id = %subscriber_id,
                consecutive_failures = health.consecutive_failures,
                "Recorded subscriber failure"
            );
        }

        Ok(health)
    }

    /// Clear the pause flag. Deliveries resume on the next dispatch or retry scan.
    pub async fn resume(&self, subscriber_id: Uuid) -> WebhookResult<()> {
        self.store.resume_subscriber(subscriber_id).await?;
        tracing::info!(
            target: "webhook_health",
            subscriber_id = %subscriber_id,
            "Subscriber resumed by operator"
        );
        Ok(())
    }
}
