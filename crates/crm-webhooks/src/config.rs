//! Engine configuration.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::executor::DEFAULT_TIMEOUT_SECS;
use crate::health::PAUSE_THRESHOLD;
use crate::validation::TargetPolicy;

/// Hard ceiling on records claimed per retry scan.
pub const MAX_RETRY_BATCH_SIZE: usize = 100;

pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 16;
pub const DEFAULT_RETRY_CONCURRENCY: usize = 10;
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 300;
pub const DEFAULT_RETRY_POLL_INTERVAL_SECS: u64 = 30;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}")]
    Missing { var: String },

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Tunables shared by the dispatcher, executor and retry scheduler.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Per-attempt HTTP timeout.
    pub http_timeout: Duration,
    /// Subscribers attempted in parallel for one dispatched event.
    pub dispatch_concurrency: usize,
    /// Records claimed per retry scan, at most [`MAX_RETRY_BATCH_SIZE`].
    pub retry_batch_size: usize,
    /// Claimed records attempted in parallel.
    pub retry_concurrency: usize,
    /// Consecutive failures that pause a subscriber.
    pub pause_threshold: u32,
    /// Age after which an in-flight claim is considered abandoned.
    pub claim_lease: Duration,
    /// Delay between retry scans in the worker loop.
    pub retry_poll_interval: Duration,
    pub target_policy: TargetPolicy,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            retry_batch_size: MAX_RETRY_BATCH_SIZE,
            retry_concurrency: DEFAULT_RETRY_CONCURRENCY,
            pause_threshold: PAUSE_THRESHOLD,
            claim_lease: Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS),
            retry_poll_interval: Duration::from_secs(DEFAULT_RETRY_POLL_INTERVAL_SECS),
            target_policy: TargetPolicy::default(),
        }
    }
}

impl WebhookConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (defaults in parentheses):
    /// - `WEBHOOK_HTTP_TIMEOUT_SECS` (30)
    /// - `WEBHOOK_DISPATCH_CONCURRENCY` (16)
    /// - `WEBHOOK_RETRY_BATCH_SIZE` (100, clamped to 100)
    /// - `WEBHOOK_RETRY_CONCURRENCY` (10)
    /// - `WEBHOOK_PAUSE_THRESHOLD` (10)
    /// - `WEBHOOK_CLAIM_LEASE_SECS` (300)
    /// - `WEBHOOK_RETRY_POLL_INTERVAL_SECS` (30)
    /// - `WEBHOOK_ALLOW_INTERNAL_TARGETS` (false)
    /// - `WEBHOOK_ALLOW_HTTP` (true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(lookup);

        let http_timeout = env
            .positive_u64("WEBHOOK_HTTP_TIMEOUT_SECS")?
            .map_or(defaults.http_timeout, Duration::from_secs);

        let dispatch_concurrency = env
            .positive_usize("WEBHOOK_DISPATCH_CONCURRENCY")?
            .unwrap_or(defaults.dispatch_concurrency);

        let retry_batch_size = env
            .positive_usize("WEBHOOK_RETRY_BATCH_SIZE")?
            .unwrap_or(defaults.retry_batch_size)
            .min(MAX_RETRY_BATCH_SIZE);

        let retry_concurrency = env
            .positive_usize("WEBHOOK_RETRY_CONCURRENCY")?
            .unwrap_or(defaults.retry_concurrency);

        let pause_threshold = match env.positive_u64("WEBHOOK_PAUSE_THRESHOLD")? {
            Some(v) => u32::try_from(v).map_err(|_| ConfigError::InvalidValue {
                var: "WEBHOOK_PAUSE_THRESHOLD".to_string(),
                message: format!("{v} is too large"),
            })?,
            None => defaults.pause_threshold,
        };

        let claim_lease = env
            .positive_u64("WEBHOOK_CLAIM_LEASE_SECS")?
            .map_or(defaults.claim_lease, Duration::from_secs);

        let retry_poll_interval = env
            .positive_u64("WEBHOOK_RETRY_POLL_INTERVAL_SECS")?
            .map_or(defaults.retry_poll_interval, Duration::from_secs);

        let target_policy = TargetPolicy {
            allow_http: env
                .bool("WEBHOOK_ALLOW_HTTP")?
                .unwrap_or(defaults.target_policy.allow_http),
            allow_internal: env
                .bool("WEBHOOK_ALLOW_INTERNAL_TARGETS")?
                .unwrap_or(defaults.target_policy.allow_internal),
        };

        Ok(Self {
            http_timeout,
            dispatch_concurrency,
            retry_batch_size,
            retry_concurrency,
            pause_threshold,
            claim_lease,
            retry_poll_interval,
            target_policy,
        })
    }

    /// Claim lease as a chrono duration for timestamp arithmetic.
    #[must_use]
    pub fn claim_lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_CLAIM_LEASE_SECS as i64))
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn positive_u64(&self, var: &str) -> Result<Option<u64>, ConfigError> {
        let Some(raw) = self.get(var) else {
            return Ok(None);
        };
        match raw.parse::<u64>() {
            Ok(0) => Err(invalid(var, "must be greater than zero")),
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(invalid(var, &format!("{raw:?} is not a number: {e}"))),
        }
    }

    fn positive_usize(&self, var: &str) -> Result<Option<usize>, ConfigError> {
        self.positive_u64(var)?
            .map(|v| usize::try_from(v).map_err(|_| invalid(var, "value is too large")))
            .transpose()
    }

    fn bool(&self, var: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.get(var) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(invalid(var, &format!("{raw:?} is not a boolean"))),
        }
    }
}

fn invalid(var: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        message: message.to_string(),
    }
}
