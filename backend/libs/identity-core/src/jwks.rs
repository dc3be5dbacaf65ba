//! JSON Web Key Set ingestion
//!
//! Turns a published key set (RFC 7517) into `VerificationKey`s. Keys that can
//! not be used to verify signatures are skipped one by one, so a single
//! unexpected entry in the provider's set never hides the usable keys.

use crate::error::KeySourceError;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Public key bound to the single algorithm it may verify
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl VerificationKey {
    pub fn new(kid: impl Into<String>, algorithm: Algorithm, key: DecodingKey) -> Self {
        Self {
            kid: kid.into(),
            algorithm,
            key,
        }
    }

    /// Build an RS256 key from a PEM encoded RSA public key
    pub fn from_rsa_pem(kid: impl Into<String>, pem: &[u8]) -> Result<Self, KeySourceError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| KeySourceError::Unavailable(format!("invalid RSA public key: {e}")))?;
        Ok(Self::new(kid, Algorithm::RS256, key))
    }

    /// Convert one JWK; `None` when it is not a usable signature key
    pub fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let kid = jwk.common.key_id.clone()?;

        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }

        let algorithm = match jwk.common.key_algorithm {
            Some(declared) => signature_algorithm(declared)?,
            None => default_algorithm(&jwk.algorithm)?,
        };

        // Symmetric material never comes from a public key set.
        if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
            return None;
        }

        let key = DecodingKey::from_jwk(jwk).ok()?;
        Some(Self::new(kid, algorithm, key))
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

/// Parse a JWKS document body
///
/// A body that is not a key set at all is an availability failure: the
/// provider answered, but not with anything we can trust.
pub fn parse_key_set(body: &[u8]) -> Result<Vec<VerificationKey>, KeySourceError> {
    let raw: RawKeySet = serde_json::from_slice(body)
        .map_err(|e| KeySourceError::Unavailable(format!("undecodable key set: {e}")))?;

    let keys = raw
        .keys
        .into_iter()
        .filter_map(|value| {
            let jwk: Jwk = match serde_json::from_value(value) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable JWK");
                    return None;
                }
            };
            let key = VerificationKey::from_jwk(&jwk);
            if key.is_none() {
                debug!(kid = ?jwk.common.key_id, "Skipping non-signature JWK");
            }
            key
        })
        .collect();

    Ok(keys)
}

fn signature_algorithm(declared: KeyAlgorithm) -> Option<Algorithm> {
    match declared {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

fn default_algorithm(params: &AlgorithmParameters) -> Option<Algorithm> {
    match params {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
        AlgorithmParameters::OctetKey(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TRUSTED_KID, TRUSTED_MODULUS};
    use serde_json::json;

    #[test]
    fn test_parse_keycloak_style_key_set() {
        let body = json!({
            "keys": [
                {
                    "kid": TRUSTED_KID,
                    "kty": "RSA",
                    "alg": "RS256",
                    "use": "sig",
                    "n": TRUSTED_MODULUS,
                    "e": "AQAB"
                },
                {
                    "kid": "enc-key",
                    "kty": "RSA",
                    "alg": "RSA-OAEP",
                    "use": "enc",
                    "n": TRUSTED_MODULUS,
                    "e": "AQAB"
                }
            ]
        });

        let keys = parse_key_set(body.to_string().as_bytes()).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid(), TRUSTED_KID);
        assert_eq!(keys[0].algorithm(), Algorithm::RS256);
    }

    #[test]
    fn test_missing_alg_defaults_from_key_type() {
        let body = json!({
            "keys": [{ "kid": "k1", "kty": "RSA", "n": TRUSTED_MODULUS, "e": "AQAB" }]
        });

        let keys = parse_key_set(body.to_string().as_bytes()).unwrap();
        assert_eq!(keys[0].algorithm(), Algorithm::RS256);
    }

    #[test]
    fn test_symmetric_and_unknown_entries_are_skipped() {
        let body = json!({
            "keys": [
                { "kid": "hmac", "kty": "oct", "alg": "HS256", "k": "c2VjcmV0" },
                { "kid": "weird", "kty": "XYZ" },
                { "kty": "RSA", "n": TRUSTED_MODULUS, "e": "AQAB" }
            ]
        });

        let keys = parse_key_set(body.to_string().as_bytes()).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_non_key_set_body_is_unavailable() {
        let err = parse_key_set(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, KeySourceError::Unavailable(_)));
    }
}
