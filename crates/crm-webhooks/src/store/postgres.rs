//! PostgreSQL-backed store.
//!
//! Retry claims use `FOR UPDATE SKIP LOCKED` so any number of workers can
//! scan the same table without handing one record to two of them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{ClaimedDelivery, DeliveryStore};
use crate::error::{WebhookError, WebhookResult};
use crate::health::SubscriberHealth;
use crate::models::{
    AttemptResult, DeliveryAttempt, DeliveryRecord, DeliveryStatus, NewDelivery, Subscriber,
    WebhookEventType,
};

/// [`DeliveryStore`] over a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> WebhookResult<()> {
        tracing::info!(target: "webhook_delivery", "Running webhook migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!(target: "webhook_delivery", "Webhook migrations completed");
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct SubscriberRow {
    id: Uuid,
    url: String,
    secret: Option<String>,
    events: Vec<String>,
    custom_headers: Json<BTreeMap<String, String>>,
    active: bool,
    max_retries: i32,
    base_retry_delay_secs: i64,
    consecutive_failures: i32,
    paused: bool,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriberRow> for Subscriber {
    type Error = WebhookError;

    fn try_from(row: SubscriberRow) -> Result<Self, Self::Error> {
        let events = row
            .events
            .iter()
            .map(|e| {
                WebhookEventType::parse(e)
                    .ok_or_else(|| WebhookError::InvalidData(format!("Unknown event type: {e}")))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            id: row.id,
            url: row.url,
            secret: row.secret,
            events,
            custom_headers: row.custom_headers.0,
            active: row.active,
            max_retries: to_u32(row.max_retries),
            base_retry_delay: Duration::seconds(row.base_retry_delay_secs),
            health: SubscriberHealth {
                consecutive_failures: to_u32(row.consecutive_failures),
                paused: row.paused,
                last_success_at: row.last_success_at,
                last_failure_at: row.last_failure_at,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct HealthRow {
    consecutive_failures: i32,
    paused: bool,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl From<HealthRow> for SubscriberHealth {
    fn from(row: HealthRow) -> Self {
        Self {
            consecutive_failures: to_u32(row.consecutive_failures),
            paused: row.paused,
            last_success_at: row.last_success_at,
            last_failure_at: row.last_failure_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: Uuid,
    subscriber_id: Uuid,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    response_status: Option<i32>,
    response_body: Option<String>,
    error_message: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    latency_ms: Option<i64>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = WebhookError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let event = WebhookEventType::parse(&row.event_type).ok_or_else(|| {
            WebhookError::InvalidData(format!("Unknown event type: {}", row.event_type))
        })?;
        let status = DeliveryStatus::parse(&row.status).ok_or_else(|| {
            WebhookError::InvalidData(format!("Unknown delivery status: {}", row.status))
        })?;

        Ok(Self {
            id: row.id,
            subscriber_id: row.subscriber_id,
            event,
            payload: row.payload,
            status,
            response_status: row.response_status.and_then(|s| u16::try_from(s).ok()),
            response_body: row.response_body,
            error_message: row.error_message,
            sent_at: row.sent_at,
            latency_ms: row.latency_ms.and_then(|l| u64::try_from(l).ok()),
            retry_count: to_u32(row.retry_count),
            next_retry_at: row.next_retry_at,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    delivery_id: Uuid,
    attempt_number: i32,
    attempted_at: DateTime<Utc>,
    success: bool,
    response_status: Option<i32>,
    error_message: Option<String>,
    latency_ms: i64,
}

impl From<AttemptRow> for DeliveryAttempt {
    fn from(row: AttemptRow) -> Self {
        Self {
            delivery_id: row.delivery_id,
            attempt_number: to_u32(row.attempt_number),
            attempted_at: row.attempted_at,
            success: row.success,
            response_status: row.response_status.and_then(|s| u16::try_from(s).ok()),
            error_message: row.error_message,
            latency_ms: u64::try_from(row.latency_ms).unwrap_or(0),
        }
    }
}

fn to_u32(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

const SUBSCRIBER_COLUMNS: &str = "id, url, secret, events, custom_headers, active, max_retries, \
     base_retry_delay_secs, consecutive_failures, paused, last_success_at, last_failure_at";

#[async_trait]
impl DeliveryStore for PgStore {
    async fn upsert_subscriber(&self, subscriber: Subscriber) -> WebhookResult<()> {
        let events: Vec<String> = subscriber
            .events
            .iter()
            .map(|e| e.as_str().to_string())
            .collect();

        sqlx::query(
            r"
            INSERT INTO webhook_subscribers (
                id, url, secret, events, custom_headers, active, max_retries,
                base_retry_delay_secs, consecutive_failures, paused,
                last_success_at, last_failure_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                events = EXCLUDED.events,
                custom_headers = EXCLUDED.custom_headers,
                active = EXCLUDED.active,
                max_retries = EXCLUDED.max_retries,
                base_retry_delay_secs = EXCLUDED.base_retry_delay_secs,
                consecutive_failures = EXCLUDED.consecutive_failures,
                paused = EXCLUDED.paused,
                last_success_at = EXCLUDED.last_success_at,
                last_failure_at = EXCLUDED.last_failure_at,
                updated_at = NOW()
            ",
        )
        .bind(subscriber.id)
        .bind(&subscriber.url)
        .bind(&subscriber.secret)
        .bind(&events)
        .bind(Json(&subscriber.custom_headers))
        .bind(subscriber.active)
        .bind(to_i32(subscriber.max_retries))
        .bind(subscriber.base_retry_delay.num_seconds())
        .bind(to_i32(subscriber.health.consecutive_failures))
        .bind(subscriber.health.paused)
        .bind(subscriber.health.last_success_at)
        .bind(subscriber.health.last_failure_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_subscriber(&self, id: Uuid) -> WebhookResult<Option<Subscriber>> {
        let row: Option<SubscriberRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM webhook_subscribers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscriber::try_from).transpose()
    }

    async fn eligible_subscribers(
        &self,
        event: WebhookEventType,
    ) -> WebhookResult<Vec<Subscriber>> {
        let rows: Vec<SubscriberRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM webhook_subscribers \
             WHERE active AND NOT paused AND $1 = ANY(events) \
             ORDER BY id"
        ))
        .bind(event.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscriber::try_from).collect()
    }

    async fn record_subscriber_success(&self, id: Uuid, at: DateTime<Utc>) -> WebhookResult<()> {
        let result = sqlx::query(
            r"
            UPDATE webhook_subscribers
            SET consecutive_failures = 0, last_success_at = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookError::SubscriberNotFound);
        }
        Ok(())
    }

    async fn record_subscriber_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: u32,
    ) -> WebhookResult<SubscriberHealth> {
        // Right-hand sides see the pre-update row, so the increment and the
        // threshold check agree within one statement.
        let row: Option<HealthRow> = sqlx::query_as(
            r"
            UPDATE webhook_subscribers
            SET consecutive_failures = consecutive_failures + 1,
                last_failure_at = $2,
                paused = paused OR consecutive_failures + 1 >= $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING consecutive_failures, paused, last_success_at, last_failure_at
            ",
        )
        .bind(id)
        .bind(at)
        .bind(to_i32(threshold))
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriberHealth::from)
            .ok_or(WebhookError::SubscriberNotFound)
    }

    async fn resume_subscriber(&self, id: Uuid) -> WebhookResult<()> {
        let result = sqlx::query(
            r"
            UPDATE webhook_subscribers
            SET paused = FALSE, consecutive_failures = 0, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookError::SubscriberNotFound);
        }
        Ok(())
    }

    async fn create_delivery(&self, new: NewDelivery) -> WebhookResult<DeliveryRecord> {
        let row: DeliveryRow = sqlx::query_as(
            r"
            INSERT INTO webhook_deliveries (
                id, subscriber_id, event_type, payload, status, retry_count, created_at
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, $5)
            RETURNING *
            ",
        )
        .bind(new.id)
        .bind(new.subscriber_id)
        .bind(new.event.as_str())
        .bind(&new.payload)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_delivery(&self, id: Uuid) -> WebhookResult<Option<DeliveryRecord>> {
        let row: Option<DeliveryRow> =
            sqlx::query_as("SELECT * FROM webhook_deliveries WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(DeliveryRecord::try_from).transpose()
    }

    async fn list_deliveries(
        &self,
        subscriber_id: Uuid,
        limit: usize,
    ) -> WebhookResult<Vec<DeliveryRecord>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r"
            SELECT * FROM webhook_deliveries
            WHERE subscriber_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(subscriber_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        result: AttemptResult,
    ) -> WebhookResult<DeliveryRecord> {
        let row: Option<DeliveryRow> = sqlx::query_as(
            r"
            UPDATE webhook_deliveries
            SET status = $2,
                response_status = $3,
                response_body = $4,
                error_message = $5,
                sent_at = $6,
                latency_ms = $7,
                retry_count = $8,
                next_retry_at = $9,
                claimed_at = NULL
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(result.status.as_str())
        .bind(result.response_status.map(i32::from))
        .bind(&result.response_body)
        .bind(&result.error_message)
        .bind(result.sent_at)
        .bind(to_i64(result.latency_ms))
        .bind(to_i32(result.retry_count))
        .bind(result.next_retry_at)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(WebhookError::DeliveryNotFound)?.try_into()
    }

    async fn mark_exhausted(&self, id: Uuid) -> WebhookResult<DeliveryRecord> {
        let row: Option<DeliveryRow> = sqlx::query_as(
            r"
            UPDATE webhook_deliveries
            SET status = 'failed', next_retry_at = NULL, claimed_at = NULL
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(WebhookError::DeliveryNotFound)?.try_into()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> WebhookResult<Vec<ClaimedDelivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r"
            UPDATE webhook_deliveries
            SET status = 'in_flight', claimed_at = $1
            WHERE id IN (
                SELECT d.id
                FROM webhook_deliveries d
                JOIN webhook_subscribers s ON s.id = d.subscriber_id
                WHERE s.active
                    AND NOT s.paused
                    AND (
                        (d.status = 'failed'
                            AND d.next_retry_at IS NOT NULL
                            AND d.next_retry_at <= $1)
                        OR (d.status = 'in_flight' AND d.claimed_at <= $2)
                        OR (d.status = 'pending' AND d.created_at <= $2)
                    )
                ORDER BY d.next_retry_at ASC NULLS LAST, d.created_at ASC
                LIMIT $3
                FOR UPDATE OF d SKIP LOCKED
            )
            RETURNING *
            ",
        )
        .bind(now)
        .bind(now - lease)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let subscriber_ids: Vec<Uuid> = rows.iter().map(|r| r.subscriber_id).collect();
        let subscriber_rows: Vec<SubscriberRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM webhook_subscribers WHERE id = ANY($1)"
        ))
        .bind(&subscriber_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut subscribers = HashMap::with_capacity(subscriber_rows.len());
        for row in subscriber_rows {
            let sub = Subscriber::try_from(row)?;
            subscribers.insert(sub.id, sub);
        }

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let record = DeliveryRecord::try_from(row)?;
            let subscriber = subscribers
                .get(&record.subscriber_id)
                .cloned()
                .ok_or(WebhookError::SubscriberNotFound)?;
            claimed.push(ClaimedDelivery { record, subscriber });
        }
        Ok(claimed)
    }

    async fn append_attempt(&self, attempt: DeliveryAttempt) -> WebhookResult<()> {
        sqlx::query(
            r"
            INSERT INTO webhook_delivery_attempts (
                delivery_id, attempt_number, attempted_at, success,
                response_status, error_message, latency_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(attempt.delivery_id)
        .bind(to_i32(attempt.attempt_number))
        .bind(attempt.attempted_at)
        .bind(attempt.success)
        .bind(attempt.response_status.map(i32::from))
        .bind(&attempt.error_message)
        .bind(to_i64(attempt.latency_ms))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_attempts(&self, delivery_id: Uuid) -> WebhookResult<Vec<DeliveryAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r"
            SELECT delivery_id, attempt_number, attempted_at, success,
                   response_status, error_message, latency_ms
            FROM webhook_delivery_attempts
            WHERE delivery_id = $1
            ORDER BY attempt_number ASC, id ASC
            ",
        )
        .bind(delivery_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeliveryAttempt::from).collect())
    }
}
