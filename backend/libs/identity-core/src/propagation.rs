//! Cross-transport identity propagation
//!
//! When the HTTP edge has already verified a caller, it can hand the result to
//! the RPC side in one of two ways:
//!
//! - `ReVerify` (default): forward the original bearer credential and let the
//!   RPC layer verify it again. Nothing new to trust.
//! - `TrustForwarded`: forward a compact, HMAC-signed encoding of the verified
//!   claims in the `x-forwarded-identity` header. The RPC layer checks the MAC,
//!   the stamp's freshness and the audience instead of the token.
//!
//! Wire format: `base64url(json payload) "." base64url(HMAC-SHA256(payload part))`.

use crate::claims::IdentityClaims;
use crate::error::VerificationError;
use crate::verifier::{Clock, SystemClock, MAX_CREDENTIAL_LEN};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Metadata / header key carrying a forwarded identity
pub const FORWARDED_IDENTITY_HEADER: &str = "x-forwarded-identity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationMode {
    #[default]
    ReVerify,
    TrustForwarded,
}

impl PropagationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationMode::ReVerify => "re-verify",
            PropagationMode::TrustForwarded => "trust-forwarded-identity",
        }
    }
}

impl fmt::Display for PropagationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown propagation mode {0:?} (expected re-verify or trust-forwarded-identity)")]
pub struct UnknownPropagationMode(pub String);

impl FromStr for PropagationMode {
    type Err = UnknownPropagationMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "re-verify" | "reverify" => Ok(PropagationMode::ReVerify),
            "trust-forwarded-identity" | "trust-forwarded" => Ok(PropagationMode::TrustForwarded),
            other => Err(UnknownPropagationMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("forwarding secret must be at least {min} bytes")]
    SecretTooShort { min: usize },

    #[error("failed to encode forwarded identity: {0}")]
    Encode(String),
}

#[derive(Serialize, Deserialize)]
struct ForwardedPayload {
    sub: String,
    roles: Vec<String>,
    aud: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    exp: i64,
    /// When the forwarding hop stamped this identity
    fwd: i64,
}

/// Signs and checks forwarded identities under a shared internal secret
#[derive(Clone)]
pub struct ForwardedIdentityCodec {
    secret: Arc<[u8]>,
    max_age_secs: i64,
    clock: Arc<dyn Clock>,
}

impl ForwardedIdentityCodec {
    pub const MIN_SECRET_LEN: usize = 32;
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

    pub fn new(secret: &[u8]) -> Result<Self, CodecError> {
        if secret.len() < Self::MIN_SECRET_LEN {
            return Err(CodecError::SecretTooShort {
                min: Self::MIN_SECRET_LEN,
            });
        }

        Ok(Self {
            secret: Arc::from(secret),
            max_age_secs: Self::DEFAULT_MAX_AGE.as_secs() as i64,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn encode(&self, claims: &IdentityClaims) -> Result<String, CodecError> {
        let payload = ForwardedPayload {
            sub: claims.subject_id().to_string(),
            roles: claims.roles().iter().cloned().collect(),
            aud: claims.audience().to_string(),
            iat: claims.issued_at().map(|t| t.timestamp()),
            exp: claims.expires_at().timestamp(),
            fwd: self.clock.now().timestamp(),
        };

        let json = serde_json::to_vec(&payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(body.as_bytes())?.finalize().into_bytes());

        Ok(format!("{body}.{signature}"))
    }

    /// Rebuild claims a trusted hop verified, or reject the header
    pub fn decode(
        &self,
        value: &str,
        expected_audience: &str,
    ) -> Result<IdentityClaims, VerificationError> {
        let invalid = || VerificationError::ForwardedIdentityInvalid;

        if value.len() > MAX_CREDENTIAL_LEN {
            return Err(invalid());
        }

        let (body, signature) = value.split_once('.').ok_or_else(invalid)?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;

        self.mac(body.as_bytes())
            .map_err(|_| invalid())?
            .verify_slice(&signature)
            .map_err(|_| invalid())?;

        let json = URL_SAFE_NO_PAD.decode(body).map_err(|_| invalid())?;
        let payload: ForwardedPayload = serde_json::from_slice(&json).map_err(|_| invalid())?;

        let now = self.clock.now().timestamp();
        if (now - payload.fwd).abs() > self.max_age_secs {
            return Err(invalid());
        }
        if now >= payload.exp {
            return Err(VerificationError::TokenExpired);
        }
        if payload.aud != expected_audience {
            return Err(VerificationError::AudienceMismatch);
        }
        if payload.sub.is_empty() {
            return Err(invalid());
        }

        let expires_at = DateTime::from_timestamp(payload.exp, 0).ok_or_else(invalid)?;
        let issued_at = payload.iat.and_then(|iat| DateTime::from_timestamp(iat, 0));

        Ok(IdentityClaims::new(
            payload.sub,
            payload.roles.into_iter().collect(),
            payload.aud,
            issued_at,
            expires_at,
        ))
    }

    fn mac(&self, body: &[u8]) -> Result<HmacSha256, CodecError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CodecError::Encode(format!("HMAC error: {e}")))?;
        mac.update(body);
        Ok(mac)
    }
}

impl fmt::Debug for ForwardedIdentityCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedIdentityCodec")
            .field("max_age_secs", &self.max_age_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::FixedClock;
    use chrono::{Duration as ChronoDuration, Utc};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn claims() -> IdentityClaims {
        IdentityClaims::new(
            "user-1".into(),
            ["admin", "member"].iter().map(|r| r.to_string()).collect(),
            "omniauth".into(),
            Some(Utc::now() - ChronoDuration::minutes(1)),
            Utc::now() + ChronoDuration::minutes(5),
        )
    }

    #[test]
    fn test_decode_reproduces_claims() {
        let codec = ForwardedIdentityCodec::new(SECRET).unwrap();
        let original = claims();

        let header = codec.encode(&original).unwrap();
        let decoded = codec.decode(&header, "omniauth").unwrap();

        assert_eq!(decoded.subject_id(), original.subject_id());
        assert_eq!(decoded.roles(), original.roles());
        assert_eq!(decoded.expires_at().timestamp(), original.expires_at().timestamp());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let codec = ForwardedIdentityCodec::new(SECRET).unwrap();
        let header = codec.encode(&claims()).unwrap();
        let (_, signature) = header.split_once('.').unwrap();

        let forged_body = URL_SAFE_NO_PAD.encode(
            br#"{"sub":"root","roles":["admin"],"aud":"omniauth","exp":9999999999,"fwd":0}"#,
        );
        let forged = format!("{forged_body}.{signature}");

        assert_eq!(
            codec.decode(&forged, "omniauth").unwrap_err(),
            VerificationError::ForwardedIdentityInvalid
        );
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let sender = ForwardedIdentityCodec::new(SECRET).unwrap();
        let receiver = ForwardedIdentityCodec::new(b"ffffffffffffffffffffffffffffffff").unwrap();

        let header = sender.encode(&claims()).unwrap();
        assert_eq!(
            receiver.decode(&header, "omniauth").unwrap_err(),
            VerificationError::ForwardedIdentityInvalid
        );
    }

    #[test]
    fn test_stale_stamp_is_rejected() {
        let codec = ForwardedIdentityCodec::new(SECRET).unwrap();
        let header = codec.encode(&claims()).unwrap();

        let later = Utc::now() + ChronoDuration::seconds(31);
        let receiver = codec.clone().with_clock(Arc::new(FixedClock(later)));
        assert_eq!(
            receiver.decode(&header, "omniauth").unwrap_err(),
            VerificationError::ForwardedIdentityInvalid
        );
    }

    #[test]
    fn test_audience_must_match_receiver() {
        let codec = ForwardedIdentityCodec::new(SECRET).unwrap();
        let header = codec.encode(&claims()).unwrap();
        assert_eq!(
            codec.decode(&header, "billing").unwrap_err(),
            VerificationError::AudienceMismatch
        );
    }

    #[test]
    fn test_short_secret_and_garbage() {
        assert!(matches!(
            ForwardedIdentityCodec::new(b"short"),
            Err(CodecError::SecretTooShort { .. })
        ));

        let codec = ForwardedIdentityCodec::new(SECRET).unwrap();
        for value in ["", "no-dot", "a.b", "!!.!!"] {
            assert_eq!(
                codec.decode(value, "omniauth").unwrap_err(),
                VerificationError::ForwardedIdentityInvalid
            );
        }
    }

    #[test]
    fn test_parse_propagation_mode() {
        assert_eq!(
            "re-verify".parse::<PropagationMode>().unwrap(),
            PropagationMode::ReVerify
        );
        assert_eq!(
            "Trust-Forwarded-Identity".parse::<PropagationMode>().unwrap(),
            PropagationMode::TrustForwarded
        );
        assert!("sometimes".parse::<PropagationMode>().is_err());
        assert_eq!(PropagationMode::default(), PropagationMode::ReVerify);
    }
}
