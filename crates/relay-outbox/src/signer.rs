//! Webhook payload signing
//!
//! Subscribers authenticate deliveries by recomputing
//! `HMAC-SHA256(secret, "{timestamp}.{body}")` and comparing hex digests.
//! The timestamp binding limits replay of captured payloads.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 digest of `"{timestamp}.{body}"`.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a received signature, for subscriber-side use.
pub fn verify(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let expected = sign(secret, timestamp, body);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
