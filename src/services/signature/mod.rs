use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::warn;

#[cfg(test)]
pub mod mock;

type HmacSha256 = Hmac<Sha256>;

/// Checks a webhook signature against the raw request body. Only the boolean
/// verdict is exposed; callers never see why a signature was refused.
pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}

/// Processor-style signatures: `t=<unix seconds>,v1=<hex hmac>` where the MAC
/// covers `"<t>.<raw body>"`. Several `v1` entries may be present during
/// secret rotation; any match is accepted.
pub struct HmacWebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl HmacWebhookVerifier {
    pub fn new(secret: &str, tolerance: Duration) -> Self {
        let secret = secret.strip_prefix("whsec_").unwrap_or(secret);
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance,
        }
    }

    fn mac_hex(&self, timestamp: i64, payload: &[u8]) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Header value for `payload` signed at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let sig = self.mac_hex(timestamp, payload).unwrap_or_default();
        format!("t={timestamp},v1={sig}")
    }

    fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> bool {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let Some(timestamp) = timestamp else {
            warn!("billing signature header without timestamp");
            return false;
        };
        if candidates.is_empty() {
            warn!("billing signature header without v1 signature");
            return false;
        }

        let skew = now.saturating_sub(timestamp).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            warn!(timestamp, now, skew, "billing signature timestamp outside tolerance");
            return false;
        }

        let Some(expected) = self.mac_hex(timestamp, payload) else {
            return false;
        };
        candidates
            .iter()
            .any(|provided| bool::from(expected.as_bytes().ct_eq(provided.as_bytes())))
    }
}

impl WebhookVerifier for HmacWebhookVerifier {
    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"external_id":"evt_1"}"#;

    fn verifier() -> HmacWebhookVerifier {
        HmacWebhookVerifier::new("whsec_test_secret", Duration::from_secs(300))
    }

    #[test]
    fn accepts_own_signature() {
        let v = verifier();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = v.sign(BODY, now);
        assert!(v.verify(BODY, &header));
    }

    #[test]
    fn rejects_tampered_body() {
        let v = verifier();
        let header = v.sign(BODY, 1_000);
        assert!(!v.verify_at(br#"{"external_id":"evt_2"}"#, &header, 1_000));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let v = verifier();
        let header = v.sign(BODY, 1_000);
        assert!(v.verify_at(BODY, &header, 1_300));
        assert!(!v.verify_at(BODY, &header, 1_301));
    }

    #[test]
    fn accepts_any_rotated_signature() {
        let v = verifier();
        let good = v.sign(BODY, 5_000);
        let sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t=5000,v1=deadbeef,v1={sig}");
        assert!(v.verify_at(BODY, &header, 5_000));
    }

    #[test]
    fn rejects_garbage_headers() {
        let v = verifier();
        assert!(!v.verify_at(BODY, "", 0));
        assert!(!v.verify_at(BODY, "t=abc,v1=00", 0));
        assert!(!v.verify_at(BODY, "t=0", 0));
    }

    #[test]
    fn different_secret_does_not_verify() {
        let other = HmacWebhookVerifier::new("another", Duration::from_secs(300));
        let header = other.sign(BODY, 10);
        assert!(!verifier().verify_at(BODY, &header, 10));
    }
}
