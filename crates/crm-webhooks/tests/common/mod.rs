//! Common test utilities for crm-webhooks integration tests.
//!
//! Provides wiremock responders, a scripted executor for simulated-time
//! tests, and fixtures for subscribers and delivery records.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use crm_webhooks::executor::{
    DeliveryExecutor, DeliveryFailure, DeliveryOutcome, DeliveryRequest, DeliveryTarget,
};
use crm_webhooks::models::{
    AttemptResult, DeliveryAttempt, DeliveryRecord, DeliveryStatus, NewDelivery,
};
use crm_webhooks::store::{ClaimedDelivery, DeliveryStore};
use crm_webhooks::{
    HttpDeliveryExecutor, InMemoryStore, Subscriber, SubscriberHealth, TargetPolicy,
    WebhookError, WebhookEventType, WebhookResult,
};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

static INIT: Once = Once::new();

/// Initialize logging for tests (once). Only active when RUST_LOG is set.
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

pub const SECRET_1: &str = "whsec_test_secret_key_12345";
pub const SECRET_2: &str = "whsec_another_secret_67890";

/// Fixed start time for simulated-clock tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 2, 9, 30, 0).unwrap()
}

/// `{"id": "<id>"}` as an opaque domain payload.
pub fn deal_payload(id: &str) -> Box<RawValue> {
    RawValue::from_string(serde_json::json!({ "id": id }).to_string()).unwrap()
}

/// HTTP executor allowed to reach the loopback mock server.
pub fn http_executor() -> Arc<HttpDeliveryExecutor> {
    Arc::new(
        HttpDeliveryExecutor::new(std::time::Duration::from_secs(2), TargetPolicy::permissive())
            .unwrap(),
    )
}

/// Insert a record that has already failed its first attempt and is due at `due_at`.
pub async fn seed_failed_delivery(
    store: &dyn DeliveryStore,
    subscriber: &Subscriber,
    retry_count: u32,
    due_at: DateTime<Utc>,
) -> DeliveryRecord {
    let record = store
        .create_delivery(NewDelivery {
            id: Uuid::new_v4(),
            subscriber_id: subscriber.id,
            event: WebhookEventType::DealWon,
            payload: br#"{"deliveryId":"seeded","event":"deal.won"}"#.to_vec(),
            created_at: due_at - Duration::minutes(1),
        })
        .await
        .unwrap();

    store
        .complete_attempt(
            record.id,
            AttemptResult {
                status: DeliveryStatus::Failed,
                response_status: Some(503),
                response_body: None,
                error_message: Some("HTTP 503: Service Unavailable".to_string()),
                sent_at: due_at - Duration::minutes(1),
                latency_ms: 10,
                retry_count,
                next_retry_at: Some(due_at),
            },
        )
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// ScriptedExecutor - in-process executor with a fixed failure budget
// ---------------------------------------------------------------------------

/// Executor that fails the first `failures` calls with HTTP 500, then succeeds.
///
/// Every request is recorded, so tests can inspect what would have been sent.
#[derive(Clone)]
pub struct ScriptedExecutor {
    failures: u32,
    calls: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<(DeliveryTarget, DeliveryRequest)>>>,
    delay: Option<std::time::Duration>,
    in_flight: Arc<AtomicU32>,
    max_in_flight: Arc<AtomicU32>,
}

impl ScriptedExecutor {
    pub fn always_ok() -> Self {
        Self::fail_times(0)
    }

    pub fn always_fail() -> Self {
        Self::fail_times(u32::MAX)
    }

    pub fn fail_times(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            in_flight: Arc::new(AtomicU32::new(0)),
            max_in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Sleep before answering, to widen race windows.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of attempts observed running at the same time.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(DeliveryTarget, DeliveryRequest)> {
        self.requests.lock().unwrap().clone()
    }

    /// How many times each delivery id was attempted.
    pub fn attempts_per_delivery(&self) -> HashMap<Uuid, usize> {
        let mut counts = HashMap::new();
        for (_, request) in self.requests() {
            *counts.entry(request.delivery_id).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl DeliveryExecutor for ScriptedExecutor {
    async fn execute(&self, target: &DeliveryTarget, request: &DeliveryRequest) -> DeliveryOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((target.clone(), request.clone()));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if n < self.failures {
            DeliveryOutcome::failed(
                DeliveryFailure::Application {
                    status: 500,
                    reason: "Internal Server Error".to_string(),
                },
                7,
            )
        } else {
            DeliveryOutcome::delivered(200, "ok".to_string(), 7)
        }
    }
}

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting webhook requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

/// A wiremock responder that captures incoming requests.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    /// Create a new capture responder that returns 200 OK.
    pub fn new() -> Self {
        Self::with_status(200)
    }

    /// Create a capture responder that returns a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Captured requests sent to `path`.
    pub fn requests_to(&self, path: &str) -> Vec<CapturedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            path: request.url.path().to_string(),
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code).set_body_string("received")
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

/// A wiremock responder that fails a specified number of times before succeeding.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Create a responder that fails `n` times with 500, then returns 200.
    pub fn fail_times(n: u32) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code: 500,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

// ---------------------------------------------------------------------------
// FaultyStore - in-memory store with injectable write failures
// ---------------------------------------------------------------------------

/// Wraps [`InMemoryStore`] and fails selected writes on demand.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    fail_attempt_log: AtomicBool,
    complete_failures: AtomicU32,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `append_attempt` call fails.
    pub fn fail_attempt_log(self) -> Self {
        self.fail_attempt_log.store(true, Ordering::SeqCst);
        self
    }

    /// The next `n` `complete_attempt` calls fail.
    pub fn fail_complete_times(self, n: u32) -> Self {
        self.complete_failures.store(n, Ordering::SeqCst);
        self
    }

    fn injected(what: &str) -> WebhookError {
        WebhookError::Internal(format!("injected {what} failure"))
    }
}

#[async_trait]
impl DeliveryStore for FaultyStore {
    async fn upsert_subscriber(&self, subscriber: Subscriber) -> WebhookResult<()> {
        self.inner.upsert_subscriber(subscriber).await
    }

    async fn get_subscriber(&self, id: Uuid) -> WebhookResult<Option<Subscriber>> {
        self.inner.get_subscriber(id).await
    }

    async fn eligible_subscribers(
        &self,
        event: WebhookEventType,
    ) -> WebhookResult<Vec<Subscriber>> {
        self.inner.eligible_subscribers(event).await
    }

    async fn record_subscriber_success(&self, id: Uuid, at: DateTime<Utc>) -> WebhookResult<()> {
        self.inner.record_subscriber_success(id, at).await
    }

    async fn record_subscriber_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: u32,
    ) -> WebhookResult<SubscriberHealth> {
        self.inner.record_subscriber_failure(id, at, threshold).await
    }

    async fn resume_subscriber(&self, id: Uuid) -> WebhookResult<()> {
        self.inner.resume_subscriber(id).await
    }

    async fn create_delivery(&self, new: NewDelivery) -> WebhookResult<DeliveryRecord> {
        self.inner.create_delivery(new).await
    }

    async fn get_delivery(&self, id: Uuid) -> WebhookResult<Option<DeliveryRecord>> {
        self.inner.get_delivery(id).await
    }

    async fn list_deliveries(
        &self,
        subscriber_id: Uuid,
        limit: usize,
    ) -> WebhookResult<Vec<DeliveryRecord>> {
        self.inner.list_deliveries(subscriber_id, limit).await
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        result: AttemptResult,
    ) -> WebhookResult<DeliveryRecord> {
        let should_fail = self
            .complete_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Self::injected("complete_attempt"));
        }
        self.inner.complete_attempt(id, result).await
    }

    async fn mark_exhausted(&self, id: Uuid) -> WebhookResult<DeliveryRecord> {
        self.inner.mark_exhausted(id).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> WebhookResult<Vec<ClaimedDelivery>> {
        self.inner.claim_due(now, limit, lease).await
    }

    async fn append_attempt(&self, attempt: DeliveryAttempt) -> WebhookResult<()> {
        if self.fail_attempt_log.load(Ordering::SeqCst) {
            return Err(Self::injected("append_attempt"));
        }
        self.inner.append_attempt(attempt).await
    }

    async fn list_attempts(&self, delivery_id: Uuid) -> WebhookResult<Vec<DeliveryAttempt>> {
        self.inner.list_attempts(delivery_id).await
    }
}
