//! HMAC-SHA256 signatures for outbound webhook payloads.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a payload, producing `sha256=<hex digest>`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length");
    mac.update(payload);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Check a signature produced by [`sign`]. Malformed input is a mismatch.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    let expected = sign(secret, payload);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
