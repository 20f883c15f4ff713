//! Signed opaque tokens: HMAC-SHA256 over a canonical JSON payload.
//!
//! Wire format: `base64url(payload) + "." + base64url(HMAC-SHA256(secret, base64url(payload)))`.
//!
//! The signature covers the base64 payload exactly as received - verification
//! never re-serializes a parsed representation, so key ordering can never
//! silently invalidate outstanding cookies. All failure modes (missing dot,
//! bad base64, signature mismatch, unparsable payload) collapse to `None`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a session cookie.
///
/// Field order is the canonical serialization order; do not reorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    /// Always `"session"` for session cookies.
    pub kind: String,
    /// Session id, matched against the in-memory session table.
    pub sid: String,
    /// Device the session is bound to.
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Expiry, milliseconds since the Unix epoch.
    pub exp: u64,
}

impl SessionClaims {
    /// Builds session claims for a device.
    pub fn new(sid: impl Into<String>, device_id: impl Into<String>, exp: u64) -> Self {
        Self {
            kind: "session".to_string(),
            sid: sid.into(),
            device_id: device_id.into(),
            exp,
        }
    }
}

/// Signs and verifies opaque tokens with a host-local secret.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    /// Creates a codec around the persisted signing secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signs a payload, producing the dotted token string.
    pub fn sign<T: Serialize>(&self, payload: &T) -> String {
        // serde_json emits struct fields in declaration order, which is the
        // canonical form for this codec.
        let json = serde_json::to_vec(payload).expect("payload serialization cannot fail");
        let payload_b64 = URL_SAFE_NO_PAD.encode(json);
        let sig = self.signature_for(payload_b64.as_bytes());
        format!("{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig))
    }

    /// Verifies a token's signature and returns the decoded payload bytes.
    ///
    /// Signature comparison is constant time. Returns `None` for any
    /// malformed or tampered token.
    pub fn verify_payload(&self, token: &str) -> Option<Vec<u8>> {
        let (payload_b64, sig_b64) = token.split_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(payload_b64.as_bytes());
        // verify_slice is constant time over the signature bytes.
        mac.verify_slice(&sig).ok()?;

        URL_SAFE_NO_PAD.decode(payload_b64).ok()
    }

    /// Verifies a session cookie: signature, payload shape, kind and expiry.
    pub fn verify_session(&self, token: &str, now_ms: u64) -> Option<SessionClaims> {
        let payload = self.verify_payload(token)?;
        let claims: SessionClaims = serde_json::from_slice(&payload).ok()?;
        if claims.kind != "session" || claims.exp <= now_ms {
            return None;
        }
        Some(claims)
    }

    fn signature_for(&self, payload_b64: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(payload_b64);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new([7u8; 32].to_vec())
    }

    #[test]
    fn sign_verify_round_trip() {
        let claims = SessionClaims::new("sid-1", "device-1", 10_000);
        let token = codec().sign(&claims);
        let decoded = codec().verify_session(&token, 5_000).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn any_single_bit_flip_invalidates() {
        let claims = SessionClaims::new("sid-1", "device-1", 10_000);
        let token = codec().sign(&claims);

        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            if bytes[i] == b'.' {
                continue;
            }
            let mut tampered = bytes.to_vec();
            tampered[i] ^= 0x01;
            if let Ok(tampered) = String::from_utf8(tampered) {
                assert!(
                    codec().verify_payload(&tampered).is_none(),
                    "bit flip at {} accepted",
                    i
                );
            }
        }
    }

    #[test]
    fn forged_device_id_fails_signature() {
        let claims = SessionClaims::new("sid-1", "device-a", 10_000);
        let token = codec().sign(&claims);
        let (_, sig) = token.split_once('.').unwrap();

        let forged = SessionClaims::new("sid-1", "device-b", 10_000);
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_token = format!("{}.{}", forged_payload, sig);

        assert!(codec().verify_session(&forged_token, 0).is_none());
    }

    #[test]
    fn expired_or_wrong_kind_rejected() {
        let claims = SessionClaims::new("sid-1", "device-1", 10_000);
        let token = codec().sign(&claims);
        assert!(codec().verify_session(&token, 10_000).is_none());

        let mut wrong_kind = claims;
        wrong_kind.kind = "refresh".to_string();
        let token = codec().sign(&wrong_kind);
        assert!(codec().verify_session(&token, 0).is_none());
    }

    #[test]
    fn malformed_tokens_rejected() {
        let c = codec();
        assert!(c.verify_payload("").is_none());
        assert!(c.verify_payload("no-dot-here").is_none());
        assert!(c.verify_payload("!!!.###").is_none());
        assert!(c.verify_payload("YWJj.").is_none());
    }

    #[test]
    fn payload_must_parse_as_claims() {
        let c = codec();
        // Valid signature over a non-object payload still fails session checks.
        let token = c.sign(&"just a string");
        assert!(c.verify_payload(&token).is_some());
        assert!(c.verify_session(&token, 0).is_none());
    }

    #[test]
    fn different_secret_rejects() {
        let claims = SessionClaims::new("sid-1", "device-1", 10_000);
        let token = codec().sign(&claims);
        let other = TokenCodec::new([8u8; 32].to_vec());
        assert!(other.verify_payload(&token).is_none());
    }
}
