//! Retry scanning for failed deliveries.
//!
//! Each run claims due records atomically, so any number of scheduler
//! instances can run against the same store. Claimed records are resent from
//! their frozen envelope with linear backoff until they succeed or reach the
//! subscriber's `max_retries`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::attempt::record_attempt;
use crate::clock::{Clock, SystemClock};
use crate::config::{
    WebhookConfig, DEFAULT_CLAIM_LEASE_SECS, DEFAULT_RETRY_CONCURRENCY,
    DEFAULT_RETRY_POLL_INTERVAL_SECS, MAX_RETRY_BATCH_SIZE,
};
use crate::error::{WebhookError, WebhookResult};
use crate::executor::{DeliveryExecutor, DeliveryRequest};
use crate::health::HealthTracker;
use crate::store::{ClaimedDelivery, DeliveryStore};

/// When the next retry is due after `completed_retries` retries.
///
/// Linear backoff: `now + base_delay × (completed_retries + 1)`. Returns
/// `None` once `completed_retries` has reached `max_retries`.
#[must_use]
pub fn next_retry_at(
    now: DateTime<Utc>,
    base_delay: Duration,
    completed_retries: u32,
    max_retries: u32,
) -> Option<DateTime<Utc>> {
    if completed_retries >= max_retries {
        return None;
    }
    let multiplier = i32::try_from(completed_retries.saturating_add(1)).ok()?;
    let delay = base_delay.checked_mul(multiplier)?;
    now.checked_add_signed(delay)
}

/// Counts for one retry scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryRunSummary {
    /// Records claimed by this run.
    pub claimed: usize,
    /// Retries that succeeded.
    pub succeeded: usize,
    /// Retries that failed and were rescheduled.
    pub failed: usize,
    /// Records closed for good by this run.
    pub exhausted: usize,
    /// Records that could not be processed (store error or task failure).
    pub errored: usize,
}

enum RetryOutcome {
    Succeeded,
    Failed,
    Exhausted,
}

/// Periodically re-attempts due, non-exhausted failed deliveries.
#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn DeliveryStore>,
    executor: Arc<dyn DeliveryExecutor>,
    health: HealthTracker,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    concurrency: usize,
    claim_lease: Duration,
    poll_interval: StdDuration,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn DeliveryStore>, executor: Arc<dyn DeliveryExecutor>) -> Self {
        Self {
            health: HealthTracker::new(store.clone()),
            store,
            executor,
            clock: Arc::new(SystemClock),
            batch_size: MAX_RETRY_BATCH_SIZE,
            concurrency: DEFAULT_RETRY_CONCURRENCY,
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS as i64),
            poll_interval: StdDuration::from_secs(DEFAULT_RETRY_POLL_INTERVAL_SECS),
        }
    }

    pub fn from_config(
        store: Arc<dyn DeliveryStore>,
        executor: Arc<dyn DeliveryExecutor>,
        config: &WebhookConfig,
    ) -> Self {
        Self::new(store, executor)
            .with_batch_size(config.retry_batch_size)
            .with_concurrency(config.retry_concurrency)
            .with_claim_lease(config.claim_lease_chrono())
            .with_poll_interval(config.retry_poll_interval)
            .with_pause_threshold(config.pause_threshold)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records claimed per run, clamped to `1..=100`.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_RETRY_BATCH_SIZE);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_pause_threshold(mut self, threshold: u32) -> Self {
        self.health = self.health.with_pause_threshold(threshold);
        self
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Claim one batch of due records and process it.
    pub async fn run_once(&self) -> RetryRunSummary {
        let now = self.clock.now();
        let claimed = match self
            .store
            .claim_due(now, self.batch_size, self.claim_lease)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(
                    target: "webhook_retry",
                    error = %e,
                    "Failed to claim due deliveries"
                );
                return RetryRunSummary::default();
            }
        };

        let mut summary = RetryRunSummary {
            claimed: claimed.len(),
            ..RetryRunSummary::default()
        };

        if claimed.is_empty() {
            tracing::debug!(target: "webhook_retry", "No deliveries due for retry");
            return summary;
        }

        tracing::info!(
            target: "webhook_retry",
            count = claimed.len(),
            "Processing pending retries"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for item in claimed {
            let this = self.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let delivery_id = item.record.id;
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => this.process(item).await,
                    Err(e) => Err(WebhookError::Internal(format!(
                        "Retry semaphore closed: {e}"
                    ))),
                };
                (delivery_id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(RetryOutcome::Succeeded))) => summary.succeeded += 1,
                Ok((_, Ok(RetryOutcome::Failed))) => summary.failed += 1,
                Ok((_, Ok(RetryOutcome::Exhausted))) => summary.exhausted += 1,
                Ok((delivery_id, Err(e))) => {
                    tracing::error!(
                        target: "webhook_retry",
                        delivery_id = %delivery_id,
                        error = %e,
                        "Failed to process retry"
                    );
                    summary.errored += 1;
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_retry",
                        error = %e,
                        "Retry task panicked"
                    );
                    summary.errored += 1;
                }
            }
        }

        tracing::info!(
            target: "webhook_retry",
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            exhausted = summary.exhausted,
            errored = summary.errored,
            "Retry run finished"
        );

        summary
    }

    /// Run [`run_once`](Self::run_once) every `poll_interval` until `cancel`
    /// turns true. A full batch is followed immediately by another scan.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        tracing::info!(
            target: "webhook_retry",
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            concurrency = self.concurrency,
            pause_threshold = self.health.pause_threshold(),
            "Retry scheduler started"
        );

        loop {
            if *cancel.borrow() {
                break;
            }

            let summary = self.run_once().await;
            if summary.claimed >= self.batch_size {
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                changed = cancel.changed() => {
                    // Sender dropped: nobody can cancel us anymore, so stop.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(target: "webhook_retry", "Retry scheduler stopped");
    }

    async fn process(&self, item: ClaimedDelivery) -> WebhookResult<RetryOutcome> {
        let ClaimedDelivery { record, subscriber } = item;

        if record.retry_count >= subscriber.max_retries {
            self.store.mark_exhausted(record.id).await?;
            tracing::warn!(
                target: "webhook_retry",
                delivery_id = %record.id,
                subscriber_id = %subscriber.id,
                retry_count = record.retry_count,
                max_retries = subscriber.max_retries,
                "Delivery exhausted all retries"
            );
            return Ok(RetryOutcome::Exhausted);
        }

        let request = DeliveryRequest::from_record(&record);
        let attempted_at = self.clock.now();
        let outcome = self.executor.execute(&subscriber.target(), &request).await;
        let retry_count = record.retry_count.saturating_add(1);

        let updated = record_attempt(
            self.store.as_ref(),
            &self.health,
            &record,
            &subscriber,
            &outcome,
            retry_count,
            attempted_at,
        )
        .await?;

        if outcome.is_success() {
            tracing::info!(
                target: "webhook_retry",
                delivery_id = %record.id,
                subscriber_id = %subscriber.id,
                retry_count,
                latency_ms = outcome.latency_ms,
                "Retry delivered"
            );
            return Ok(RetryOutcome::Succeeded);
        }

        match updated.next_retry_at {
            Some(next_retry_at) => {
                tracing::warn!(
                    target: "webhook_retry",
                    delivery_id = %record.id,
                    subscriber_id = %subscriber.id,
                    retry_count,
                    error = ?outcome.error_message(),
                    failure_kind = outcome.failure_kind().map(|k| k.as_str()),
                    next_retry_at = %next_retry_at,
                    "Retry failed, rescheduled"
                );
                Ok(RetryOutcome::Failed)
            }
            None => {
                tracing::warn!(
                    target: "webhook_retry",
                    delivery_id = %record.id,
                    subscriber_id = %subscriber.id,
                    retry_count,
                    max_retries = subscriber.max_retries,
                    error = ?outcome.error_message(),
                    failure_kind = outcome.failure_kind().map(|k| k.as_str()),
                    "Delivery exhausted all retries"
                );
                Ok(RetryOutcome::Exhausted)
            }
        }
    }
}
