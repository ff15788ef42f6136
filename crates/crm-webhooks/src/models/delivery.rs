//! Delivery records and the per-attempt log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WebhookEventType;

/// Persisted status of a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, first attempt not finished yet.
    Pending,
    /// Claimed by a retry worker; an attempt is running.
    InFlight,
    /// Delivered with a 2xx response. Terminal.
    Success,
    /// Last attempt failed. Retried while `next_retry_at` is set.
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown delivery status: {s}"))
    }
}

/// Lifecycle view of a record, derived from its persisted columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    /// Failed, another attempt is due at `next_retry_at`.
    Scheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    Success,
    /// Failed with no further automatic attempts.
    Exhausted { retry_count: u32 },
}

impl DeliveryState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Exhausted { .. })
    }
}

/// One evolving record per (subscriber, event occurrence).
///
/// Retries mutate this record in place; the history of individual tries is
/// kept separately as [`DeliveryAttempt`] rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub event: WebhookEventType,
    /// Frozen, serialized envelope. Every attempt sends exactly these bytes.
    pub payload: Vec<u8>,
    pub status: DeliveryStatus,
    pub response_status: Option<u16>,
    /// Response body, truncated.
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set while a retry worker holds the record.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Build the initial pending record.
    #[must_use]
    pub fn pending(new: NewDelivery) -> Self {
        Self {
            id: new.id,
            subscriber_id: new.subscriber_id,
            event: new.event,
            payload: new.payload,
            status: DeliveryStatus::Pending,
            response_status: None,
            response_body: None,
            error_message: None,
            sent_at: None,
            latency_ms: None,
            retry_count: 0,
            next_retry_at: None,
            claimed_at: None,
            created_at: new.created_at,
        }
    }

    #[must_use]
    pub fn state(&self) -> DeliveryState {
        match (self.status, self.next_retry_at) {
            (DeliveryStatus::Pending, _) => DeliveryState::Pending,
            (DeliveryStatus::InFlight, _) => DeliveryState::InFlight,
            (DeliveryStatus::Success, _) => DeliveryState::Success,
            (DeliveryStatus::Failed, Some(next_retry_at)) => DeliveryState::Scheduled {
                retry_count: self.retry_count,
                next_retry_at,
            },
            (DeliveryStatus::Failed, None) => DeliveryState::Exhausted {
                retry_count: self.retry_count,
            },
        }
    }

    /// Apply the result of an attempt to this record.
    pub fn apply(&mut self, result: &AttemptResult) {
        self.status = result.status;
        self.response_status = result.response_status;
        self.response_body.clone_from(&result.response_body);
        self.error_message.clone_from(&result.error_message);
        self.sent_at = Some(result.sent_at);
        self.latency_ms = Some(result.latency_ms);
        self.retry_count = result.retry_count;
        self.next_retry_at = result.next_retry_at;
        self.claimed_at = None;
    }

    /// Close the record for good without another attempt.
    pub fn exhaust(&mut self) {
        self.status = DeliveryStatus::Failed;
        self.next_retry_at = None;
        self.claimed_at = None;
    }

    /// Whether a retry worker may claim this record at `now`.
    ///
    /// Due failed records are claimable, as are in-flight records whose claim
    /// is older than `lease` (the previous worker is presumed dead). A record
    /// still pending `lease` after creation lost its first attempt and is
    /// claimable too.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        match self.status {
            DeliveryStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            DeliveryStatus::InFlight => self.claimed_at.is_some_and(|at| at + lease <= now),
            DeliveryStatus::Pending => self.created_at + lease <= now,
            DeliveryStatus::Success => false,
        }
    }
}

/// Input for creating a pending record.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub event: WebhookEventType,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Fields written to a record after an attempt finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub status: DeliveryStatus,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Append-only log entry for one attempt of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub delivery_id: Uuid,
    /// 1 for the initial dispatch, `n + 1` for the n-th retry.
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub response_status: Option<u16>,
    pub error_message: Option<String>,
    pub latency_ms: u64,
}
