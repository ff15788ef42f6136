//! Subscriber target URL validation and SSRF protection.
//!
//! A target that fails validation is a configuration problem of that one
//! subscriber: the attempt is recorded as failed without any network call.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::WebhookError;

/// Which targets the executor is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPolicy {
    /// Permit plain `http://` targets.
    pub allow_http: bool,
    /// Permit loopback, private and link-local destinations.
    pub allow_internal: bool,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            allow_http: true,
            allow_internal: false,
        }
    }
}

impl TargetPolicy {
    /// Policy for local development and tests against a loopback mock server.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allow_http: true,
            allow_internal: true,
        }
    }

    /// HTTPS only, no internal hosts.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            allow_http: false,
            allow_internal: false,
        }
    }
}

/// Parse and validate a subscriber target URL.
///
/// Checks:
/// 1. URL is parseable and absolute
/// 2. Scheme is HTTPS, or HTTP when the policy allows it
/// 3. Host is not a private/internal address unless the policy allows it
pub fn validate_target_url(url: &str, policy: &TargetPolicy) -> Result<Url, WebhookError> {
    let parsed =
        Url::parse(url).map_err(|e| WebhookError::InvalidUrl(format!("Invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        "http" => {
            return Err(WebhookError::InvalidUrl(
                "Webhook URLs must use HTTPS".to_string(),
            ));
        }
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "Unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| WebhookError::InvalidUrl("URL must have a host".to_string()))?;

    if !policy.allow_internal {
        check_host_not_internal(&host)?;
    }

    Ok(parsed)
}

fn check_host_not_internal(host: &Host<&str>) -> Result<(), WebhookError> {
    let internal = match host {
        Host::Ipv4(v4) => is_internal_ip(&IpAddr::V4(*v4)),
        Host::Ipv6(v6) => is_internal_ip(&IpAddr::V6(*v6)),
        Host::Domain(name) => is_internal_hostname(name),
    };

    if internal {
        return Err(WebhookError::SsrfDetected(format!(
            "Destination host {host} is a private/internal address"
        )));
    }
    Ok(())
}

fn is_internal_hostname(name: &str) -> bool {
    let lower = name.trim_end_matches('.').to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_v4(&mapped);
            }
            is_internal_v6(v6)
        }
    }
}

fn is_internal_v4(v4: &Ipv4Addr) -> bool {
    let [a, b, ..] = v4.octets();
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local() // 169.254.0.0/16, cloud metadata
        || v4.is_broadcast()
        || v4.is_unspecified()
        || (a == 100 && (b & 0xC0) == 64) // 100.64.0.0/10 CGNAT
}

fn is_internal_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (first & 0xffc0) == 0xfe80 // fe80::/10 link local
}
