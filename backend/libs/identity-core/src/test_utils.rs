//! Test fixtures: fixed RSA keys, token minting and a scriptable key-set fetcher
//!
//! Enabled with the `test-utils` feature. Never use these keys outside tests.

use crate::claims::IdentityClaims;
use crate::error::KeySourceError;
use crate::jwks::VerificationKey;
use crate::key_source::KeySetFetcher;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_AUDIENCE: &str = "omniauth";
pub const TEST_ISSUER: &str = "http://keycloak.test/realms/omni";

pub const TRUSTED_KID: &str = "omni-rs256-2024";
pub const ROTATED_KID: &str = "omni-rs256-2025";
pub const UNTRUSTED_KID: &str = "attacker-key";

pub const TRUSTED_PRIVATE_KEY: &str = include_str!("../tests/fixtures/trusted_private.pem");
pub const TRUSTED_PUBLIC_KEY: &str = include_str!("../tests/fixtures/trusted_public.pem");
pub const ROTATED_PRIVATE_KEY: &str = include_str!("../tests/fixtures/rotated_private.pem");
pub const ROTATED_PUBLIC_KEY: &str = include_str!("../tests/fixtures/rotated_public.pem");
pub const UNTRUSTED_PRIVATE_KEY: &str = include_str!("../tests/fixtures/untrusted_private.pem");

/// Base64url modulus of the trusted key, as published in a JWKS
pub const TRUSTED_MODULUS: &str = "3ek_BAtPiE5Teq8Dx14ekOQ7ZaXkE0UnHiQ2zMlhvwOLoFDK-yioDO9BUqUfANWSert3xj23PxfTDYUzr2S5ZPmc4QDj8gtsU47MpsTSejd6k-QPbXNFQu8XuueQq16r7FekAJ4LOk3eRi45tRMX6zZ7xrt00c5WQatm_iU7LIROzOCMJ-h6X-WVR5_HxZo0BdAaWcuVrcgnaUiJ9CZoxoDSWI8JQnsfD6V9T25UoLiokFBW4Ere44xVQ2WWoPaQu-cTJWDdav39yNFy-U5gJx4daFUYSIk9xlIObnAcsAYeb-jZ5aBj_uQmVtiOa732dNHOx5t03XTXJdHNE6717w";

/// Base64url modulus of the rotated key
pub const ROTATED_MODULUS: &str = "yKn3XU7q_ELg0V9dbsgfqwm4g2Fuc4Qs4jTnix6C9HSgDF_5WdtZcq2gZTSTXqomHXVxrK3VZctEKo719jG8eeE-uNRMg0ANEwec7VdUamMEN4-cx-C3qERouI4qgdK3e93Xew9J0jFPeenAnWxrLTBht1dl8aUEJeb95L9sOevsmN61O-yxgbRU5ExAVPuAAPYsUsrIVCRgD6jem4dVEsJUotyFtaaiDv4hYXMsKTTUExq3nD8OfpnNJJMSgBQlMzEWVH7pgmzidEBEQ5chOlZBjIFpFTI69o78KjOqb6zs4wUc4txPi_MuTJIpamReDqOifXcFCt75wGwMvFvrzw";

pub fn trusted_key() -> VerificationKey {
    VerificationKey::from_rsa_pem(TRUSTED_KID, TRUSTED_PUBLIC_KEY.as_bytes())
        .expect("trusted test key must parse")
}

pub fn rotated_key() -> VerificationKey {
    VerificationKey::from_rsa_pem(ROTATED_KID, ROTATED_PUBLIC_KEY.as_bytes())
        .expect("rotated test key must parse")
}

/// JWKS document publishing the given `(kid, modulus)` RSA keys
pub fn jwks_document(keys: &[(&str, &str)]) -> Value {
    let keys: Vec<Value> = keys
        .iter()
        .map(|(kid, modulus)| {
            json!({
                "kid": kid,
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "n": modulus,
                "e": "AQAB"
            })
        })
        .collect();
    json!({ "keys": keys })
}

/// Which private key signs a minted token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signer {
    Trusted,
    Rotated,
    Untrusted,
    /// HMAC keyed with the trusted *public* key: the classic algorithm confusion forgery
    HmacWithTrustedPublicKey,
}

/// Builder for signed test tokens
///
/// Defaults to a token from the trusted key for subject `user-1`, audience
/// [`TEST_AUDIENCE`], issuer [`TEST_ISSUER`], valid for five minutes.
#[derive(Debug, Clone)]
pub struct TokenBuilder {
    signer: Signer,
    kid: Option<String>,
    claims: Map<String, Value>,
}

impl TokenBuilder {
    pub fn new(subject: &str) -> Self {
        let now = Utc::now();
        let mut claims = Map::new();
        claims.insert("sub".into(), json!(subject));
        claims.insert("aud".into(), json!(TEST_AUDIENCE));
        claims.insert("iss".into(), json!(TEST_ISSUER));
        claims.insert("iat".into(), json!(now.timestamp()));
        claims.insert("exp".into(), json!((now + Duration::minutes(5)).timestamp()));

        Self {
            signer: Signer::Trusted,
            kid: Some(TRUSTED_KID.to_string()),
            claims,
        }
    }

    pub fn signed_by(mut self, signer: Signer) -> Self {
        self.signer = signer;
        self
    }

    pub fn kid(mut self, kid: &str) -> Self {
        self.kid = Some(kid.to_string());
        self
    }

    pub fn without_kid(mut self) -> Self {
        self.kid = None;
        self
    }

    pub fn audience(self, audience: Value) -> Self {
        self.claim("aud", audience)
    }

    pub fn issuer(self, issuer: &str) -> Self {
        self.claim("iss", json!(issuer))
    }

    /// Keycloak realm roles (`realm_access.roles`)
    pub fn realm_roles(self, roles: &[&str]) -> Self {
        self.claim("realm_access", json!({ "roles": roles }))
    }

    /// Keycloak client roles (`resource_access.<client>.roles`)
    pub fn client_roles(mut self, client: &str, roles: &[&str]) -> Self {
        let entry = self
            .claims
            .entry("resource_access")
            .or_insert_with(|| json!({}));
        entry[client] = json!({ "roles": roles });
        self
    }

    /// Expiry relative to now; negative values mint an expired token
    pub fn expires_in(self, offset: Duration) -> Self {
        self.claim("exp", json!((Utc::now() + offset).timestamp()))
    }

    pub fn issued_in(self, offset: Duration) -> Self {
        self.claim("iat", json!((Utc::now() + offset).timestamp()))
    }

    pub fn not_before_in(self, offset: Duration) -> Self {
        self.claim("nbf", json!((Utc::now() + offset).timestamp()))
    }

    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.claims.insert(name.to_string(), value);
        self
    }

    pub fn without_claim(mut self, name: &str) -> Self {
        self.claims.remove(name);
        self
    }

    pub fn build(self) -> String {
        let (algorithm, key) = match self.signer {
            Signer::Trusted => (Algorithm::RS256, rsa_key(TRUSTED_PRIVATE_KEY)),
            Signer::Rotated => (Algorithm::RS256, rsa_key(ROTATED_PRIVATE_KEY)),
            Signer::Untrusted => (Algorithm::RS256, rsa_key(UNTRUSTED_PRIVATE_KEY)),
            Signer::HmacWithTrustedPublicKey => (
                Algorithm::HS256,
                EncodingKey::from_secret(TRUSTED_PUBLIC_KEY.as_bytes()),
            ),
        };

        let mut header = Header::new(algorithm);
        header.kid = self.kid;

        encode(&header, &Value::Object(self.claims), &key).expect("test token must encode")
    }
}

fn rsa_key(pem: &str) -> EncodingKey {
    EncodingKey::from_rsa_pem(pem.as_bytes()).expect("test private key must parse")
}

/// Valid token from the trusted key carrying the given realm roles
pub fn token_with_roles(subject: &str, roles: &[&str]) -> String {
    TokenBuilder::new(subject).realm_roles(roles).build()
}

/// Claims as a verifier would produce them for [`TEST_AUDIENCE`]
pub fn test_claims(subject: &str, roles: &[&str]) -> IdentityClaims {
    let now = Utc::now();
    IdentityClaims::new(
        subject.to_string(),
        roles.iter().map(|role| role.to_string()).collect(),
        TEST_AUDIENCE.to_string(),
        Some(now),
        now + Duration::minutes(5),
    )
}

/// Key-set fetcher that counts calls and can be told to fail or stall
#[derive(Debug)]
pub struct CountingFetcher {
    keys: Mutex<Vec<VerificationKey>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Option<std::time::Duration>,
}

impl CountingFetcher {
    pub fn new(keys: Vec<VerificationKey>) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(keys),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: None,
        })
    }

    /// Every fetch sleeps for `delay` before answering
    pub fn with_delay(keys: Vec<VerificationKey>, delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(keys),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_keys(&self, keys: Vec<VerificationKey>) {
        *self.keys.lock().expect("fetcher keys lock") = keys;
    }
}

#[async_trait]
impl KeySetFetcher for CountingFetcher {
    async fn fetch(&self) -> Result<Vec<VerificationKey>, KeySourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(KeySourceError::Unavailable(
                "identity provider unreachable".to_string(),
            ));
        }

        Ok(self.keys.lock().expect("fetcher keys lock").clone())
    }
}
