//! Persisting the outcome of one attempt. Shared by dispatch and retry.

use chrono::{DateTime, Utc};

use crate::error::WebhookResult;
use crate::executor::DeliveryOutcome;
use crate::health::HealthTracker;
use crate::models::{AttemptResult, DeliveryAttempt, DeliveryRecord, DeliveryStatus, Subscriber};
use crate::scheduler::next_retry_at;
use crate::store::DeliveryStore;

/// Write `outcome` to the record, feed the subscriber's health and append the
/// attempt to the log.
///
/// `retry_count` is the record's count after this attempt: 0 for the initial
/// dispatch, `n` for the n-th retry. The next retry is scheduled from
/// `attempted_at` with linear backoff, or cleared once `retry_count` has
/// reached the subscriber's `max_retries`.
pub(crate) async fn record_attempt(
    store: &dyn DeliveryStore,
    health: &HealthTracker,
    record: &DeliveryRecord,
    subscriber: &Subscriber,
    outcome: &DeliveryOutcome,
    retry_count: u32,
    attempted_at: DateTime<Utc>,
) -> WebhookResult<DeliveryRecord> {
    let success = outcome.is_success();
    let result = AttemptResult {
        status: if success {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failed
        },
        response_status: outcome.status_code,
        response_body: outcome.response_body.clone(),
        error_message: outcome.error_message(),
        sent_at: attempted_at,
        latency_ms: outcome.latency_ms,
        retry_count,
        next_retry_at: if success {
            None
        } else {
            next_retry_at(
                attempted_at,
                subscriber.base_retry_delay,
                retry_count,
                subscriber.max_retries,
            )
        },
    };

    let updated = store.complete_attempt(record.id, result).await?;

    if success {
        health.record_success(subscriber.id, attempted_at).await?;
    } else {
        health.record_failure(subscriber.id, attempted_at).await?;
    }

    // Log entries are best effort. The record is authoritative.
    if let Err(e) = store
        .append_attempt(DeliveryAttempt {
            delivery_id: record.id,
            attempt_number: retry_count.saturating_add(1),
            attempted_at,
            success,
            response_status: outcome.status_code,
            error_message: outcome.error_message(),
            latency_ms: outcome.latency_ms,
        })
        .await
    {
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %record.id,
            subscriber_id = %subscriber.id,
            error = %e,
            "Failed to append delivery attempt"
        );
    }

    Ok(updated)
}
