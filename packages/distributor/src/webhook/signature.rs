//! Delivery payload signing using HMAC-SHA256.
//!
//! Each delivery body is signed with the subscription's shared secret and
//! the signature is sent in the `X-Distributor-Signature-256` header as
//! `sha256=<hex>`. Receivers recompute the HMAC over the raw body and
//! compare in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-distributor-signature-256";

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a header value, `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Parses a signature header value into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex).
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Verifies a signature header against the payload and secret.
///
/// Constant-time comparison via the `Mac` verifier.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(signature) = parse_signature_header(signature_header) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}
