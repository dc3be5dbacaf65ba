//! Bearer token verification
//!
//! `TokenVerifier::verify` is the only producer of `IdentityClaims` from a raw
//! credential. The order of checks is fixed:
//!
//! 1. Structure: the token must parse and its header must name a key id.
//! 2. Key: the key id must resolve through the `KeySource`.
//! 3. Signature: verified with the *key's* algorithm. A header that names any
//!    other algorithm is rejected before a signature check is attempted.
//! 4. Time: `now < exp`; `iat` and `nbf`, when present, must not be in the future.
//! 5. Audience, then issuer (when configured).
//! 6. Subject and roles are extracted.
//!
//! Because the signature is checked before anything in the payload is
//! trusted, a forged token always fails with `InvalidSignature`, whatever
//! its claims say.

use crate::claims::IdentityClaims;
use crate::error::VerificationError;
use crate::key_source::KeySource;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Validation};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Credentials longer than this are rejected before parsing
pub const MAX_CREDENTIAL_LEN: usize = 8 * 1024;

/// Source of "now" for temporal claim checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

impl AudienceClaim {
    fn contains(&self, expected: &str) -> bool {
        match self {
            AudienceClaim::One(aud) => aud == expected,
            AudienceClaim::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

#[derive(Deserialize, Default)]
struct RoleClaim {
    #[serde(default)]
    roles: Vec<String>,
}

/// Payload fields read after the signature has been verified
#[derive(Deserialize)]
struct RawClaims {
    sub: Option<String>,
    aud: Option<AudienceClaim>,
    iss: Option<String>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    realm_access: RoleClaim,
    #[serde(default)]
    resource_access: HashMap<String, RoleClaim>,
}

impl RawClaims {
    /// Top-level, realm and audience-client roles, flattened
    fn into_roles(mut self, audience: &str) -> BTreeSet<String> {
        let client_roles = self
            .resource_access
            .remove(audience)
            .map(|claim| claim.roles)
            .unwrap_or_default();

        self.roles
            .into_iter()
            .chain(self.realm_access.roles)
            .chain(client_roles)
            .filter(|role| !role.is_empty())
            .collect()
    }
}

/// Validates bearer tokens against a trusted key source
#[derive(Clone)]
pub struct TokenVerifier {
    keys: Arc<dyn KeySource>,
    issuer: Option<String>,
    leeway_secs: i64,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    pub fn new(keys: Arc<dyn KeySource>) -> Self {
        Self {
            keys,
            issuer: None,
            leeway_secs: 0,
            clock: Arc::new(SystemClock),
        }
    }

    /// Also require `iss` to equal `issuer`
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Tolerance for `iat`/`nbf` slightly in the future; `exp` stays strict
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway_secs = i64::try_from(leeway.as_secs()).unwrap_or(i64::MAX);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_source(&self) -> &Arc<dyn KeySource> {
        &self.keys
    }

    pub async fn verify(
        &self,
        credential: &str,
        expected_audience: &str,
    ) -> Result<IdentityClaims, VerificationError> {
        if credential.is_empty() || credential.len() > MAX_CREDENTIAL_LEN {
            return Err(VerificationError::MalformedToken);
        }

        let header = decode_header(credential).map_err(|_| VerificationError::MalformedToken)?;
        let kid = header
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(VerificationError::MalformedToken)?;

        let key = self.keys.resolve(kid).await?;

        if header.alg != key.algorithm() {
            return Err(VerificationError::InvalidSignature);
        }

        // Signature only; every claim check below is done against our own clock.
        let mut validation = Validation::new(key.algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let raw = decode::<RawClaims>(credential, key.decoding_key(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => VerificationError::MalformedToken,
                _ => VerificationError::InvalidSignature,
            })?
            .claims;

        let now = self.clock.now().timestamp();
        let exp = raw.exp.ok_or(VerificationError::MalformedToken)?;
        if now >= exp {
            return Err(VerificationError::TokenExpired);
        }
        for not_before in [raw.nbf, raw.iat].into_iter().flatten() {
            if now.saturating_add(self.leeway_secs) < not_before {
                return Err(VerificationError::TokenNotYetValid);
            }
        }

        match &raw.aud {
            Some(aud) if aud.contains(expected_audience) => {}
            _ => return Err(VerificationError::AudienceMismatch),
        }

        if let Some(expected_issuer) = &self.issuer {
            if raw.iss.as_deref() != Some(expected_issuer.as_str()) {
                return Err(VerificationError::IssuerMismatch);
            }
        }

        let subject_id = raw
            .sub
            .clone()
            .filter(|sub| !sub.is_empty())
            .ok_or(VerificationError::MalformedToken)?;
        let expires_at = DateTime::from_timestamp(exp, 0).ok_or(VerificationError::MalformedToken)?;
        let issued_at = raw.iat.and_then(|iat| DateTime::from_timestamp(iat, 0));
        let roles = raw.into_roles(expected_audience);

        Ok(IdentityClaims::new(
            subject_id,
            roles,
            expected_audience.to_string(),
            issued_at,
            expires_at,
        ))
    }
}
