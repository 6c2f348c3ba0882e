//! Webhook signatures: HMAC-SHA256 over `"{timestamp}.{body}"`, sent as
//! `t=<unix seconds>,v1=<hex digest>`.

use chrono::{DateTime, Utc};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signature verification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The header is missing a part or is not parseable.
    #[error("malformed signature header")]
    Malformed,

    /// The digest does not match the body.
    #[error("signature mismatch")]
    Mismatch,

    /// The timestamp is outside the accepted window.
    #[error("signature timestamp outside tolerance")]
    Stale,

    /// The secret cannot key the MAC.
    #[error("invalid webhook secret")]
    InvalidKey,
}

/// Verifies and produces gateway callback signatures.
#[derive(Clone)]
pub struct CallbackVerifier {
    keyed: HmacSha256,
    tolerance: chrono::Duration,
}

impl CallbackVerifier {
    /// Create a verifier accepting timestamps within `tolerance` of now.
    ///
    /// # Errors
    ///
    /// [`SignatureError::InvalidKey`] if `secret` cannot key HMAC-SHA256.
    pub fn new(secret: impl AsRef<[u8]>, tolerance: chrono::Duration) -> Result<Self, SignatureError> {
        let keyed = <HmacSha256 as KeyInit>::new_from_slice(secret.as_ref()).map_err(|_| SignatureError::InvalidKey)?;
        Ok(Self { keyed, tolerance })
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }

    /// Signature header for `body` sent at `at`.
    #[must_use]
    pub fn sign(&self, body: &[u8], at: DateTime<Utc>) -> String {
        let timestamp = at.timestamp().to_string();
        let digest = self.mac(&timestamp, body).finalize().into_bytes();
        format!("t={timestamp},v1={}", hex::encode(digest))
    }

    /// Check `header` against `body`.
    ///
    /// # Errors
    ///
    /// [`SignatureError`] describing the first failed check.
    pub fn verify(&self, header: &str, body: &[u8], now: DateTime<Utc>) -> Result<(), SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',').map(str::trim) {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(v) = part.strip_prefix("v1=") {
                signatures.push(v);
            }
        }
        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed);
        }

        let sent_at: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
        if (now.timestamp() - sent_at).abs() > self.tolerance.num_seconds() {
            return Err(SignatureError::Stale);
        }

        let mac = self.mac(timestamp, body);
        let matches = signatures.into_iter().any(|candidate| {
            hex::decode(candidate).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
        });
        if matches { Ok(()) } else { Err(SignatureError::Mismatch) }
    }
}
