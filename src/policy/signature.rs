//! Webhook payload signatures (`X-Hub-Signature-256: sha256=<hex>`).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex signature header value for `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a signature header against `body`.
///
/// A missing header, wrong prefix or non-hex digest is a mismatch.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(digest) = header.and_then(|h| h.trim().strip_prefix(SIGNATURE_PREFIX)) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Example from GitHub's webhook validation docs.
    const SECRET: &[u8] = b"It's a Secret to Everybody";
    const BODY: &[u8] = b"Hello, World!";
    const EXPECTED: &str =
        "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";

    #[test]
    fn test_sign_matches_known_vector() {
        assert_eq!(sign(SECRET, BODY), EXPECTED);
    }

    #[test]
    fn test_verify_accepts_valid_signature() {
        assert!(verify_signature(SECRET, BODY, Some(EXPECTED)));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        assert!(!verify_signature(SECRET, b"Hello, World?", Some(EXPECTED)));
    }

    #[test]
    fn test_verify_rejects_malformed_headers() {
        assert!(!verify_signature(SECRET, BODY, None));
        assert!(!verify_signature(SECRET, BODY, Some("sha1=abcdef")));
        assert!(!verify_signature(SECRET, BODY, Some("sha256=not-hex")));
    }
}
