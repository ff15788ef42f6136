//! HMAC-SHA256 payload signing for outbound webhooks.
//!
//! The signature covers the exact bytes transmitted as the request body and
//! is sent hex-encoded in the `X-Webhook-Signature` header. Subscribers
//! without a secret receive unsigned deliveries.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the HMAC-SHA256 signature of `payload` keyed by `secret`.
///
/// Returns the lowercase hex digest (64 characters).
#[must_use]
pub fn sign(payload: &[u8], secret: &str) -> String {
    hex::encode(mac_bytes(payload, secret))
}

/// Verify a hex-encoded signature for `payload` using constant-time comparison.
///
/// Malformed hex is decoded into a placeholder of the correct length so that
/// rejection costs the same as a mismatch.
#[must_use]
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    let computed = mac_bytes(payload, secret);

    let (provided, well_formed) = match hex::decode(signature) {
        Ok(bytes) if bytes.len() == computed.len() => (bytes, true),
        _ => (vec![0u8; computed.len()], false),
    };

    let matches: bool = computed.as_slice().ct_eq(provided.as_slice()).into();
    matches & well_formed
}

fn mac_bytes(payload: &[u8], secret: &str) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}
