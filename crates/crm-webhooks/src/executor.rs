//! Single-attempt HTTP delivery.
//!
//! The executor performs exactly one bounded-timeout POST and turns whatever
//! happens into a [`DeliveryOutcome`]. It never returns an error and has no
//! side effects besides the outbound request; persisting the outcome and
//! updating subscriber health is the caller's job.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::crypto;
use crate::error::WebhookError;
use crate::models::{DeliveryRecord, Envelope, WebhookEventType};
use crate::validation::{validate_target_url, TargetPolicy};

/// Per-attempt timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of characters of the response body that are kept.
pub const RESPONSE_BODY_LIMIT: usize = 4096;

pub const HEADER_EVENT: &str = "x-webhook-event";
pub const HEADER_DELIVERY: &str = "x-webhook-delivery";
pub const HEADER_SIGNATURE: &str = "x-webhook-signature";

/// Headers owned by the engine. Subscriber-configured headers with these
/// names are dropped.
const RESERVED_HEADERS: [&str; 4] = [
    "content-type",
    HEADER_EVENT,
    HEADER_DELIVERY,
    HEADER_SIGNATURE,
];

/// Where and how to deliver for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub subscriber_id: Uuid,
    pub url: String,
    pub secret: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
}

/// What to deliver: the frozen envelope bytes plus the header metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub delivery_id: Uuid,
    pub event: WebhookEventType,
    pub body: Vec<u8>,
}

impl DeliveryRequest {
    /// Resend exactly what was stored for a record.
    #[must_use]
    pub fn from_record(record: &DeliveryRecord) -> Self {
        Self {
            delivery_id: record.id,
            event: record.event,
            body: record.payload.clone(),
        }
    }
}

/// Coarse failure category, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Configuration,
    Transport,
    Application,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Application => "application",
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    /// The subscriber's target is unusable (bad URL, blocked host, bad payload).
    #[error("Invalid target: {0}")]
    Configuration(String),

    /// Network error or timeout; no response was received.
    #[error("{0}")]
    Transport(String),

    /// The subscriber answered with a non-2xx status.
    #[error("HTTP {status}: {reason}")]
    Application { status: u16, reason: String },
}

impl DeliveryFailure {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Transport(_) => FailureKind::Transport,
            Self::Application { .. } => FailureKind::Application,
        }
    }
}

/// Normalized result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub latency_ms: u64,
    pub failure: Option<DeliveryFailure>,
}

impl DeliveryOutcome {
    #[must_use]
    pub fn delivered(status_code: u16, response_body: String, latency_ms: u64) -> Self {
        Self {
            status_code: Some(status_code),
            response_body: Some(response_body),
            latency_ms,
            failure: None,
        }
    }

    #[must_use]
    pub fn failed(failure: DeliveryFailure, latency_ms: u64) -> Self {
        let status_code = match &failure {
            DeliveryFailure::Application { status, .. } => Some(*status),
            _ => None,
        };
        Self {
            status_code,
            response_body: None,
            latency_ms,
            failure: Some(failure),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: String) -> Self {
        self.response_body = Some(body);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(DeliveryFailure::kind)
    }
}

/// Performs one delivery attempt.
#[async_trait]
pub trait DeliveryExecutor: Send + Sync {
    async fn execute(&self, target: &DeliveryTarget, request: &DeliveryRequest) -> DeliveryOutcome;
}

/// [`DeliveryExecutor`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpDeliveryExecutor {
    client: Client,
    timeout: Duration,
    policy: TargetPolicy,
}

impl HttpDeliveryExecutor {
    /// Create an executor with the given per-attempt timeout and target policy.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn new(timeout: Duration, policy: TargetPolicy) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crm-webhooks/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            policy,
        })
    }

    /// Executor with the default 30 second timeout and default target policy.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self, WebhookError> {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS), TargetPolicy::default())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a fresh envelope for `data` and deliver it once.
    pub async fn send_event(
        &self,
        target: &DeliveryTarget,
        event: WebhookEventType,
        data: &RawValue,
    ) -> DeliveryOutcome {
        let envelope = Envelope::new(Uuid::new_v4(), event, Utc::now(), data);
        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                return DeliveryOutcome::failed(
                    DeliveryFailure::Configuration(format!("Failed to serialize payload: {e}")),
                    0,
                )
            }
        };

        let request = DeliveryRequest {
            delivery_id: envelope.delivery_id,
            event,
            body,
        };
        self.execute(target, &request).await
    }

    fn classify_transport_error(&self, e: &reqwest::Error) -> DeliveryFailure {
        let message = if e.is_timeout() {
            format!("Request timeout ({}s)", self.timeout.as_secs_f64())
        } else if e.is_connect() {
            format!("Connection failed: {e}")
        } else {
            format!("Request error: {e}")
        };
        DeliveryFailure::Transport(message)
    }
}

#[async_trait]
impl DeliveryExecutor for HttpDeliveryExecutor {
    async fn execute(&self, target: &DeliveryTarget, request: &DeliveryRequest) -> DeliveryOutcome {
        let url = match validate_target_url(&target.url, &self.policy) {
            Ok(url) => url,
            Err(e) => {
                return DeliveryOutcome::failed(DeliveryFailure::Configuration(e.to_string()), 0)
            }
        };

        let headers = build_headers(target, request);

        let start = Instant::now();
        let result = self
            .client
            .post(url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let latency_ms = elapsed_ms(start);
                return DeliveryOutcome::failed(self.classify_transport_error(&e), latency_ms);
            }
        };

        let status = response.status();
        let body = truncate_body(response.text().await.unwrap_or_default());
        let latency_ms = elapsed_ms(start);

        if status.is_success() {
            DeliveryOutcome::delivered(status.as_u16(), body, latency_ms)
        } else {
            let failure = DeliveryFailure::Application {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            };
            DeliveryOutcome::failed(failure, latency_ms).with_body(body)
        }
    }
}

/// Merge subscriber headers beneath the reserved webhook headers.
///
/// Custom headers that are not valid HTTP headers are skipped.
#[must_use]
pub fn build_headers(target: &DeliveryTarget, request: &DeliveryRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &target.custom_headers {
        let parsed = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        );
        match parsed {
            (Ok(name), Ok(value)) => {
                if RESERVED_HEADERS.contains(&name.as_str()) {
                    continue;
                }
                headers.insert(name, value);
            }
            _ => {
                tracing::warn!(
                    target: "webhook_delivery",
                    subscriber_id = %target.subscriber_id,
                    header = %name,
                    "Skipping invalid custom header"
                );
            }
        }
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(HEADER_EVENT),
        HeaderValue::from_static(request.event.as_str()),
    );
    if let Ok(v) = HeaderValue::from_str(&request.delivery_id.to_string()) {
        headers.insert(HeaderName::from_static(HEADER_DELIVERY), v);
    }
    if let Some(secret) = &target.secret {
        let signature = crypto::sign(&request.body, secret);
        if let Ok(v) = HeaderValue::from_str(&signature) {
            headers.insert(HeaderName::from_static(HEADER_SIGNATURE), v);
        }
    }

    headers
}

fn truncate_body(body: String) -> String {
    if body.chars().count() <= RESPONSE_BODY_LIMIT {
        return body;
    }
    body.chars().take(RESPONSE_BODY_LIMIT).collect()
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(url: String) -> DeliveryTarget {
        DeliveryTarget {
            subscriber_id: Uuid::new_v4(),
            url,
            secret: None,
            custom_headers: BTreeMap::new(),
        }
    }

    fn request() -> DeliveryRequest {
        DeliveryRequest {
            delivery_id: Uuid::new_v4(),
            event: WebhookEventType::DealWon,
            body: br#"{"deliveryId":"x","event":"deal.won"}"#.to_vec(),
        }
    }

    fn executor() -> HttpDeliveryExecutor {
        HttpDeliveryExecutor::new(Duration::from_secs(5), TargetPolicy::permissive()).unwrap()
    }

    #[test]
    fn test_reserved_headers_win_over_custom() {
        let mut t = target("https://hooks.example.com".to_string());
        t.secret = Some("secret".to_string());
        t.custom_headers
            .insert("Content-Type".to_string(), "text/plain".to_string());
        t.custom_headers
            .insert("X-Webhook-Event".to_string(), "forged".to_string());
        t.custom_headers
            .insert("x-webhook-signature".to_string(), "forged".to_string());
        t.custom_headers
            .insert("Authorization".to_string(), "Bearer abc".to_string());
        let req = request();

        let headers = build_headers(&t, &req);
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers[HEADER_EVENT], "deal.won");
        assert_eq!(headers[HEADER_DELIVERY], req.delivery_id.to_string().as_str());
        assert_eq!(headers[HEADER_SIGNATURE], crypto::sign(&req.body, "secret").as_str());
        assert_eq!(headers["authorization"], "Bearer abc");
        assert_eq!(headers.get_all(HEADER_EVENT).iter().count(), 1);
    }

    #[test]
    fn test_no_secret_means_no_signature_even_if_custom_header_set() {
        let mut t = target("https://hooks.example.com".to_string());
        t.custom_headers
            .insert("X-Webhook-Signature".to_string(), "forged".to_string());
        let headers = build_headers(&t, &request());
        assert!(headers.get(HEADER_SIGNATURE).is_none());
    }

    #[test]
    fn test_invalid_custom_headers_are_skipped() {
        let mut t = target("https://hooks.example.com".to_string());
        t.custom_headers
            .insert("bad header".to_string(), "value".to_string());
        t.custom_headers
            .insert("X-Ok".to_string(), "line\nbreak".to_string());
        t.custom_headers
            .insert("X-Tenant".to_string(), "acme".to_string());
        let headers = build_headers(&t, &request());
        assert_eq!(headers["x-tenant"], "acme");
        assert!(headers.get("x-ok").is_none());
        assert_eq!(headers.len(), 4);
    }

    #[test]
    fn test_failure_messages() {
        let app = DeliveryFailure::Application {
            status: 503,
            reason: "Service Unavailable".to_string(),
        };
        assert_eq!(app.to_string(), "HTTP 503: Service Unavailable");
        assert_eq!(app.kind(), FailureKind::Application);

        let outcome = DeliveryOutcome::failed(app, 10);
        assert_eq!(outcome.status_code, Some(503));
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.error_message().as_deref(),
            Some("HTTP 503: Service Unavailable")
        );
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Application));
        assert_eq!(FailureKind::Application.as_str(), "application");

        let transport =
            DeliveryOutcome::failed(DeliveryFailure::Transport("timed out".into()), 30_000);
        assert_eq!(transport.failure_kind(), Some(FailureKind::Transport));
        assert!(transport.status_code.is_none());
        assert_eq!(DeliveryOutcome::delivered(200, String::new(), 5).failure_kind(), None);
    }

    #[test]
    fn test_truncate_body() {
        let long = "é".repeat(RESPONSE_BODY_LIMIT + 10);
        assert_eq!(truncate_body(long).chars().count(), RESPONSE_BODY_LIMIT);
        assert_eq!(truncate_body("ok".to_string()), "ok");
    }

    #[tokio::test]
    async fn test_execute_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header(HEADER_EVENT, "deal.won"))
            .respond_with(ResponseTemplate::new(202).set_body_string("accepted"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor()
            .execute(&target(format!("{}/hook", server.uri())), &request())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.status_code, Some(202));
        assert_eq!(outcome.response_body.as_deref(), Some("accepted"));
        assert!(outcome.error_message().is_none());
    }

    #[tokio::test]
    async fn test_execute_non_2xx_is_application_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let outcome = executor().execute(&target(server.uri()), &request()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status_code, Some(500));
        assert_eq!(outcome.response_body.as_deref(), Some("boom"));
        assert_eq!(
            outcome.error_message().as_deref(),
            Some("HTTP 500: Internal Server Error")
        );
        assert_eq!(
            outcome.failure.as_ref().map(DeliveryFailure::kind),
            Some(FailureKind::Application)
        );
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "https://example.com"),
            )
            .mount(&server)
            .await;

        let outcome = executor().execute(&target(server.uri()), &request()).await;
        assert_eq!(outcome.status_code, Some(302));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_execute_timeout_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let executor =
            HttpDeliveryExecutor::new(Duration::from_millis(100), TargetPolicy::permissive())
                .unwrap();
        let outcome = executor.execute(&target(server.uri()), &request()).await;

        assert!(!outcome.is_success());
        assert!(outcome.status_code.is_none());
        assert_eq!(
            outcome.failure.as_ref().map(DeliveryFailure::kind),
            Some(FailureKind::Transport)
        );
        assert!(outcome.error_message().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_failure() {
        // Bind then drop a listener to get a port with nothing behind it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = executor()
            .execute(&target(format!("http://{addr}/hook")), &request())
            .await;

        assert!(outcome.status_code.is_none());
        assert_eq!(
            outcome.failure.as_ref().map(DeliveryFailure::kind),
            Some(FailureKind::Transport)
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_failure() {
        let outcome = executor()
            .execute(&target("not a url".to_string()), &request())
            .await;
        assert_eq!(
            outcome.failure.as_ref().map(DeliveryFailure::kind),
            Some(FailureKind::Configuration)
        );
        assert_eq!(outcome.latency_ms, 0);
    }

    #[tokio::test]
    async fn test_internal_target_blocked_by_default_policy() {
        let executor = HttpDeliveryExecutor::with_defaults().unwrap();
        let outcome = executor
            .execute(&target("http://127.0.0.1:9/hook".to_string()), &request())
            .await;
        assert_eq!(
            outcome.failure.as_ref().map(DeliveryFailure::kind),
            Some(FailureKind::Configuration)
        );
        assert!(outcome.error_message().unwrap().contains("SSRF"));
    }

    #[tokio::test]
    async fn test_send_event_builds_fresh_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let data = serde_json::value::to_raw_value(&serde_json::json!({"id": "c1"})).unwrap();
        let outcome = executor()
            .send_event(&target(server.uri()), WebhookEventType::ContactCreated, &data)
            .await;
        assert!(outcome.is_success());

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let envelope = Envelope::from_bytes(&received[0].body).unwrap();
        assert_eq!(envelope.event, WebhookEventType::ContactCreated);
        assert_eq!(
            received[0].headers[HEADER_DELIVERY],
            envelope.delivery_id.to_string().as_str()
        );
    }
}
