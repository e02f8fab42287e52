//! HMAC request signing for inter-component RPC.
//!
//! Every state-changing request between components carries three headers
//! derived from a shared symmetric secret:
//!
//! - `X-Agent-Timestamp`: decimal unix seconds
//! - `X-Agent-Nonce`: 16 random bytes, hex-encoded
//! - `X-Agent-Signature`: hex HMAC-SHA256 over
//!   `timestamp || nonce || METHOD || path || SHA256(body).hex()`
//!
//! Verifiers reject requests outside a small clock-skew window and requests
//! replaying a recently seen nonce.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Timestamp header name.
pub const TIMESTAMP_HEADER: &str = "X-Agent-Timestamp";
/// Nonce header name.
pub const NONCE_HEADER: &str = "X-Agent-Nonce";
/// Signature header name.
pub const SIGNATURE_HEADER: &str = "X-Agent-Signature";

/// Default accepted clock skew.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(60);

/// The three signing headers for one request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// Decimal unix seconds.
    pub timestamp: String,
    /// 16 random bytes, hex.
    pub nonce: String,
    /// Hex HMAC-SHA256 signature.
    pub signature: String,
}

/// Signs outbound requests with the shared secret.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    /// Build a signer over the shared secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Produce signing headers for a request.
    pub fn headers(&self, method: &str, path: &str, body: &[u8]) -> SignedHeaders {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce_bytes: [u8; 16] = rand::thread_rng().r#gen();
        let nonce = hex::encode(nonce_bytes);
        let signature = sign(&self.secret, &timestamp, &nonce, method, path, body);
        SignedHeaders {
            timestamp,
            nonce,
            signature,
        }
    }
}

fn sign(secret: &[u8], timestamp: &str, nonce: &str, method: &str, path: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    let message = format!(
        "{timestamp}{nonce}{method}{path}{body_hash}",
        method = method.to_ascii_uppercase()
    );
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Why a signed request was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The timestamp header was not a decimal integer.
    #[error("malformed timestamp")]
    MalformedTimestamp,
    /// The timestamp was outside the accepted skew window.
    #[error("timestamp outside skew window")]
    Stale,
    /// The nonce was seen recently.
    #[error("replayed nonce")]
    Replayed,
    /// The signature did not match.
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies inbound signed requests and tracks recent nonces.
pub struct Verifier {
    secret: Vec<u8>,
    skew: Duration,
    seen: Mutex<HashMap<String, i64>>,
}

impl Verifier {
    /// Build a verifier with the default skew window.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self::with_skew(secret, DEFAULT_SKEW)
    }

    /// Build a verifier with an explicit skew window.
    pub fn with_skew(secret: impl Into<Vec<u8>>, skew: Duration) -> Self {
        Self {
            secret: secret.into(),
            skew,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Verify one request. Consumes the nonce on success.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: &str,
        nonce: &str,
        signature: &str,
    ) -> Result<(), SignatureError> {
        let ts: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::MalformedTimestamp)?;
        let now = chrono::Utc::now().timestamp();
        let skew = self.skew.as_secs() as i64;
        if (now - ts).abs() > skew {
            return Err(SignatureError::Stale);
        }

        let expected = sign(&self.secret, timestamp, nonce, method, path, body);
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(expected.as_bytes());
        let expected_tag = mac.finalize().into_bytes();
        let mut given = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        given.update(signature.as_bytes());
        // Compare keyed digests of the hex strings so the comparison is
        // constant-time regardless of signature length.
        if given.finalize().into_bytes() != expected_tag {
            return Err(SignatureError::Mismatch);
        }

        let mut seen = self.seen.lock().expect("nonce cache poisoned");
        seen.retain(|_, at| (now - *at).abs() <= skew * 2);
        if seen.insert(nonce.to_string(), now).is_some() {
            return Err(SignatureError::Replayed);
        }
        Ok(())
    }
}
